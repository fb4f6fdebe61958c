//! REST and WebSocket edges over the exchange facade.

mod error;
mod rest;
mod ws;

pub use error::{
    ApiError, CODE_BAD_API_KEY, CODE_BAD_PARAMETER, CODE_BAD_SYMBOL, CODE_CANCEL_REJECTED,
    CODE_MANDATORY_PARAM, CODE_NEW_ORDER_REJECTED, CODE_ORDER_NOT_FOUND, CODE_REJECTED_KEY,
    CODE_TIMESTAMP,
};
pub use rest::{AppState, Authenticated, router};
pub use ws::WsHub;
