mod ids;
mod money;
mod token;
mod wallet;

pub use ids::{RequestId, TraceId};
pub use money::{MoneyError, TokenAmount};
pub use token::{TokenError, TokenType};
pub use wallet::{AddressError, WalletAddress};
