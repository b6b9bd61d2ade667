//! Optional peer address extractor
//!
//! Rate limiting keys on the peer address, but router tests driven through
//! `oneshot` have no connection, so the address is optional.

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::request::Parts;
use std::convert::Infallible;
use std::net::SocketAddr;

/// Peer address, or `None` when the server was not started with connect info.
#[derive(Debug, Clone, Copy)]
pub struct MaybeConnectInfo(pub Option<SocketAddr>);

impl<S> FromRequestParts<S> for MaybeConnectInfo
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(MaybeConnectInfo(
            parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|info| info.0),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    #[tokio::test]
    async fn test_missing_connect_info_is_none() {
        let (mut parts, _) = Request::builder().uri("/").body(()).unwrap().into_parts();
        let MaybeConnectInfo(addr) = MaybeConnectInfo::from_request_parts(&mut parts, &())
            .await
            .unwrap();
        assert!(addr.is_none());
    }

    #[tokio::test]
    async fn test_connect_info_present() {
        let addr: SocketAddr = "192.0.2.10:4000".parse().unwrap();
        let (mut parts, _) = Request::builder().uri("/").body(()).unwrap().into_parts();
        parts.extensions.insert(ConnectInfo(addr));

        let MaybeConnectInfo(found) = MaybeConnectInfo::from_request_parts(&mut parts, &())
            .await
            .unwrap();
        assert_eq!(found, Some(addr));
    }
}
