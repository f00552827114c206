//! Remote directory client module
//!
//! Wraps the Microsoft Graph (unified) and Azure AD Graph / Outlook REST
//! (legacy) APIs behind one [`DirectoryClient`] trait, with token handling,
//! throttling-aware retries and OData paging.

pub mod auth;
pub mod client;
pub mod directory;
pub mod error;
pub mod legacy;
pub mod types;
pub mod unified;

// Re-export main types for convenience
pub use client::{ApiMethod, GraphHttpClient, GraphHttpClientBuilder};
pub use directory::{build_directory_client, CalendarTarget, ClientSettings, DirectoryClient};
pub use error::{GraphError, Result};
pub use types::*;

pub use auth::{AppCredentials, AuthManager, AuthState, TokenScope, UserToken};
pub use legacy::LegacyDirectoryClient;
pub use unified::UnifiedDirectoryClient;
