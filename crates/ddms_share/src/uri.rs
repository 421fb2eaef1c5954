//! Data proxy URIs.

/// Scheme of URIs served through the data proxy.
pub const DATA_PROXY_SCHEME: &str = "datashareproxy://";

/// Returns true if `uri` is a data proxy URI.
pub fn is_data_proxy_uri(uri: &str) -> bool {
    uri.starts_with(DATA_PROXY_SCHEME)
}

/// Extracts the bundle name from `datashareproxy://{bundle}/{path}`.
///
/// Returns `None` for other URIs or an empty authority.
pub fn bundle_from_proxy_uri(uri: &str) -> Option<&str> {
    let rest = uri.strip_prefix(DATA_PROXY_SCHEME)?;
    let end = rest.find(['/', '?']).unwrap_or(rest.len());
    let bundle = &rest[..end];
    (!bundle.is_empty()).then_some(bundle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundle_is_the_authority() {
        assert_eq!(
            bundle_from_proxy_uri("datashareproxy://com.example.mail/inbox"),
            Some("com.example.mail")
        );
        assert_eq!(
            bundle_from_proxy_uri("datashareproxy://com.example.mail?user=100"),
            Some("com.example.mail")
        );
        assert_eq!(bundle_from_proxy_uri("datashareproxy:///inbox"), None);
        assert_eq!(bundle_from_proxy_uri("datashare://com.example.mail/inbox"), None);
    }

    proptest::proptest! {
        #[test]
        fn authority_round_trips(bundle in "[a-z][a-z0-9.]{0,20}", path in "(/[a-z0-9]{0,8}){0,3}") {
            let uri = format!("{DATA_PROXY_SCHEME}{bundle}{path}");
            proptest::prop_assert!(is_data_proxy_uri(&uri));
            proptest::prop_assert_eq!(bundle_from_proxy_uri(&uri), Some(bundle.as_str()));
        }
    }

    #[test]
    fn only_proxy_scheme_matches() {
        assert!(is_data_proxy_uri("datashareproxy://a/b"));
        assert!(!is_data_proxy_uri("datashare:///a/b"));
        assert!(!is_data_proxy_uri(""));
    }
}
