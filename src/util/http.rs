use std::time::Duration;

use reqwest::{Client, redirect::Policy};

use crate::DynError;

/// 初始化 HTTP 客户端
///
/// Redirects are not followed: callers read the `Location` header themselves.
/// An empty `http_proxy` means a direct connection, ignoring any proxy set in the environment.
pub fn init_http_client(http_proxy: &str, timeout: Duration) -> Result<Client, DynError> {
    let client_builder = Client::builder().pool_max_idle_per_host(20).redirect(Policy::none()).timeout(timeout);
    if http_proxy.is_empty() {
        Ok(client_builder.no_proxy().build()?)
    } else {
        Ok(client_builder.proxy(reqwest::Proxy::all(http_proxy)?).build()?)
    }
}
