//! Token persistence (C5) and OAuth token lifecycle management (C6).

pub mod token_manager;
pub mod token_store;

pub use token_manager::{OAuthProvider, ProviderError, ProviderTokens, TokenManager, TokenManagerError, ValidationInfo};
pub use token_store::{TokenRecord, TokenStore, TokenStoreError};
