//! Token authentication against the Miniserver
//!
//! ```text
//!   NoToken ──acquire──▶ Acquiring ──200──▶ Valid ◀──refresh ok── Refreshing
//!      ▲                                      │  └────schedule─────────▶│
//!      └──────────── 401 on use/refresh ── Invalid ◀────────401─────────┘
//! ```
//!
//! [`TokenManager`] runs the acquire/use/refresh exchanges over a
//! [`CommandChannel`](crate::client::CommandChannel); [`Token`] is the value it
//! keeps and [`PersistedToken`] the record a host application stores.

pub mod token;
pub mod token_manager;

pub use token::{loxone_epoch, PersistedToken, Token, LOXONE_EPOCH_UNIX};
pub use token_manager::{RefreshOutcome, TokenManager, TokenState};
