//! Gate-failure taxonomy and plain HTTP responses emitted by the pipeline

use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use thiserror::Error;

/// Reasons a bearer token fails the auth gate.
///
/// Each variant maps to a distinct log line so failures stay observable,
/// while clients uniformly receive 407.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    /// No Authorization header on the request
    #[error("Authorization header not found")]
    HeaderMissing,
    /// Header present but not of the form "Bearer <token>"
    #[error("Authorization header is invalid")]
    HeaderInvalid,
    /// Token string is in the revocation set
    #[error("token is invalidated")]
    Revoked,
    /// HMAC signature does not match the shared secret
    #[error("token signature is invalid")]
    SignatureInvalid,
    /// Token expired beyond the allowed leeway
    #[error("token is expired")]
    Expired,
    /// Issuer claim does not match the configured service name
    #[error("token issuer mismatch")]
    IssuerMismatch,
    /// Token could not be decoded at all
    #[error("token is malformed: {0}")]
    Malformed(String),
}

/// Build a response with the given status and no body
pub fn empty_response(status: StatusCode) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum")
}

/// Build a response with the given status and a plain-text body
pub fn text_response(
    status: StatusCode,
    body: impl Into<Bytes>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum")
}
