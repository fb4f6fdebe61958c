//! The `{code, msg}` error envelope and the stable wire codes.

use crate::account::AccountError;
use crate::exchange::ExchangeError;
use crate::orderbook::OrderBookError;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Timestamp outside the recvWindow.
pub const CODE_TIMESTAMP: i32 = -1021;
/// Invalid (non-missing) parameter value.
pub const CODE_BAD_PARAMETER: i32 = -1100;
/// Mandatory parameter missing.
pub const CODE_MANDATORY_PARAM: i32 = -1102;
/// Unknown trading symbol.
pub const CODE_BAD_SYMBOL: i32 = -1121;
/// New order rejected (includes insufficient balance).
pub const CODE_NEW_ORDER_REJECTED: i32 = -2010;
/// Cancel rejected.
pub const CODE_CANCEL_REJECTED: i32 = -2011;
/// Order does not exist.
pub const CODE_ORDER_NOT_FOUND: i32 = -2013;
/// API key absent or malformed.
pub const CODE_BAD_API_KEY: i32 = -2014;
/// API key rejected.
pub const CODE_REJECTED_KEY: i32 = -2015;

/// Error payload every failing endpoint returns.
#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    pub code: i32,
    pub msg: String,
    #[serde(skip)]
    pub status: StatusCode,
}

impl ApiError {
    #[must_use]
    pub fn new(status: StatusCode, code: i32, msg: impl Into<String>) -> Self {
        Self {
            code,
            msg: msg.into(),
            status,
        }
    }

    /// 401 / −2014: missing or malformed API key header.
    #[must_use]
    pub fn bad_api_key() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            CODE_BAD_API_KEY,
            "API-key format invalid.",
        )
    }

    /// 401 / −2015: well-formed key that does not authenticate.
    #[must_use]
    pub fn rejected_key() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            CODE_REJECTED_KEY,
            "Invalid API-key, IP, or permissions for action.",
        )
    }

    /// 400 / −1021: request timestamp outside the recvWindow.
    #[must_use]
    pub fn timestamp() -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            CODE_TIMESTAMP,
            "Timestamp for this request is outside of the recvWindow.",
        )
    }

    /// 400 / −1102: a mandatory parameter was not sent.
    #[must_use]
    pub fn mandatory(name: &str) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            CODE_MANDATORY_PARAM,
            format!("Mandatory parameter '{name}' was not sent, was empty/null, or malformed."),
        )
    }

    /// 400 / −1100: a parameter was sent but does not validate.
    #[must_use]
    pub fn bad_parameter(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, CODE_BAD_PARAMETER, msg)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct Envelope {
            code: i32,
            msg: String,
        }
        (
            self.status,
            Json(Envelope {
                code: self.code,
                msg: self.msg,
            }),
        )
            .into_response()
    }
}

impl From<OrderBookError> for ApiError {
    fn from(e: OrderBookError) -> Self {
        match &e {
            OrderBookError::UnknownSymbol(_) => {
                Self::new(StatusCode::BAD_REQUEST, CODE_BAD_SYMBOL, "Invalid symbol.")
            }
            OrderBookError::MissingParameter(name) => Self::mandatory(name),
            OrderBookError::InvalidParameter { .. } => Self::bad_parameter(e.to_string()),
            OrderBookError::OrderNotFound(_) => Self::new(
                StatusCode::BAD_REQUEST,
                CODE_ORDER_NOT_FOUND,
                "Order does not exist.",
            ),
            OrderBookError::CancelRejected { .. } => Self::new(
                StatusCode::BAD_REQUEST,
                CODE_CANCEL_REJECTED,
                "Unknown order sent.",
            ),
            OrderBookError::OrderRejected(reason) => Self::new(
                StatusCode::BAD_REQUEST,
                CODE_NEW_ORDER_REJECTED,
                reason.to_string(),
            ),
            OrderBookError::CrossedBook { .. } => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                -1000,
                "An unknown error occurred while processing the request.",
            ),
        }
    }
}

impl From<AccountError> for ApiError {
    fn from(e: AccountError) -> Self {
        match e {
            AccountError::InsufficientFunds { .. } | AccountError::InsufficientLocked { .. } => {
                Self::new(
                    StatusCode::BAD_REQUEST,
                    CODE_NEW_ORDER_REJECTED,
                    "Account has insufficient balance for requested action.",
                )
            }
            AccountError::NonPositiveAmount(_) => Self::bad_parameter(e.to_string()),
        }
    }
}

impl From<ExchangeError> for ApiError {
    fn from(e: ExchangeError) -> Self {
        match e {
            ExchangeError::Book(inner) => inner.into(),
            ExchangeError::Account(inner) => inner.into(),
        }
    }
}
