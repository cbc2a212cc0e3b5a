//! Outbound HTTP(S) client shared by the forwarding engine and the HTTP sink

use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;

pub type HttpsClient<B> = Client<HttpsConnector<HttpConnector>, B>;

/// Build a pooled client that speaks plain HTTP and HTTPS
pub fn build_client<B>(connect_timeout: Duration) -> HttpsClient<B>
where
    B: http_body::Body + Send,
    B::Data: Send,
{
    let mut http = HttpConnector::new();
    http.enforce_http(false);
    http.set_connect_timeout(Some(connect_timeout));
    http.set_nodelay(true);

    let connector = HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .wrap_connector(http);

    Client::builder(TokioExecutor::new())
        .http1_preserve_header_case(true)
        .build(connector)
}
