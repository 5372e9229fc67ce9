//! Data models for positions, orders, quotes, and balances.

mod market;
mod order;
mod position;

pub use market::{split_instrument, Balance, Quote};
pub use order::{Order, OrderAck, OrderKind, OrderRequest, OrderSide, OrderState, OrderStatus};
pub use position::{Direction, Position};
