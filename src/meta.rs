//! `x-elastic-client-meta` and `User-Agent` header construction (§6.7).

/// Builds the `x-elastic-client-meta` header value:
/// `et=<transportVer>,a=<0|1>,net=<runtimeVer>,<httpClientId>=<runtimeVer>[,h=<helper>]`.
///
/// `http_client_id` is the short id of the underlying HTTP client crate in
/// use (e.g. `"hy"` for hyper); `helper` names an optional higher-level
/// helper library layered on top of this transport.
pub fn client_meta_header(
    transport_version: &str,
    runtime_version: &str,
    http_client_id: &str,
    helper: Option<(&str, &str)>,
) -> String {
    let async_flag = 1;
    let mut value = format!(
        "et={},a={async_flag},net={},{http_client_id}={}",
        sanitize_version(transport_version),
        sanitize_version(runtime_version),
        sanitize_version(runtime_version),
    );
    if let Some((helper_id, helper_version)) = helper {
        value.push_str(&format!(",h={}={}", helper_id, sanitize_version(helper_version)));
    }
    value
}

/// Conventional `User-Agent` string: `<product>/<productVersion> (<transportVersion>)`.
pub fn user_agent(product_name: &str, product_version: &str, transport_version: &str) -> String {
    format!("{product_name}/{product_version} ({transport_version})")
}

/// Strips characters the meta-header format disallows (`,`, `=`) from a
/// version string so a malformed runtime/product version can't corrupt the
/// header's field separators.
fn sanitize_version(version: &str) -> String {
    version.chars().filter(|c| *c != ',' && *c != '=').collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_expected_meta_header_without_helper() {
        let header = client_meta_header("8.15.0", "1.80.0", "hy", None);
        assert_eq!(header, "et=8.15.0,a=1,net=1.80.0,hy=1.80.0");
    }

    #[test]
    fn builds_expected_meta_header_with_helper() {
        let header = client_meta_header("8.15.0", "1.80.0", "hy", Some(("es", "8.15.0")));
        assert_eq!(header, "et=8.15.0,a=1,net=1.80.0,hy=1.80.0,h=es=8.15.0");
    }

    #[test]
    fn user_agent_includes_product_and_transport_version() {
        let ua = user_agent("elasticsearch-rs", "8.15.0", "0.1.0");
        assert_eq!(ua, "elasticsearch-rs/8.15.0 (0.1.0)");
    }

    #[test]
    fn sanitize_strips_separators() {
        assert_eq!(sanitize_version("1,2=3"), "123");
    }
}
