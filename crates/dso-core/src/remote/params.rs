//! Query parameter translation for remote endpoints.
//!
//! Remotes use their own parameter spellings; ours translate where a mapping
//! exists, pass through plain identifier/scalar filters, and everything else
//! is rejected locally before any network traffic happens.

use dso_error::{ApiError, Result};

use crate::filters::FilterInput;

/// Local parameter name → remote spelling.
const NON_FILTERS: &[(&str, &str)] = &[
    ("_expand", "expand"),
    ("_fields", "fields"),
    ("fields", "fields"),
    ("_pageSize", "pageSize"),
    ("page_size", "pageSize"),
    ("page", "page"),
];

/// Translate the query string for forwarding.
///
/// `allowed_filters`, when set, whitelists the filter names the remote may
/// receive (e.g. to keep BSN searches off a cadastre endpoint).
///
/// # Errors
///
/// 400 for unknown filters or any lookup other than bare/`exact`.
pub fn translate_params(
    pairs: &[(String, String)],
    allowed_filters: Option<&[&str]>,
) -> Result<Vec<(String, String)>> {
    let mut result = Vec::with_capacity(pairs.len());

    for (key, value) in pairs {
        // Handled locally by the renderer, never forwarded.
        if key == "_format" || key == "format" {
            continue;
        }

        if let Some((_, remote_name)) = NON_FILTERS.iter().find(|(local, _)| local == key) {
            result.push(((*remote_name).to_string(), value.clone()));
            continue;
        }

        let filter = FilterInput::from_parameter(key, vec![value.clone()])?;
        if !filter.lookup.is_empty() && filter.lookup != "exact" {
            return Err(ApiError::InvalidFilterSyntax {
                message: format!("filter operator '{}' not supported", filter.lookup),
            });
        }
        if let Some(allowed) = allowed_filters {
            let name = filter.path_name();
            if !allowed.contains(&name.as_str()) {
                return Err(ApiError::InvalidFilterSyntax {
                    message: format!("unknown filter '{key}'"),
                });
            }
        }
        result.push((key.clone(), value.clone()));
    }

    Ok(result)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_parameter_translation() {
        let translated = translate_params(
            &pairs(&[("_expand", "true"), ("_pageSize", "10"), ("page_size", "20")]),
            None,
        )
        .unwrap();
        assert_eq!(
            translated,
            pairs(&[("expand", "true"), ("pageSize", "10"), ("pageSize", "20")])
        );
    }

    #[test]
    fn test_format_is_consumed_locally() {
        let translated = translate_params(&pairs(&[("_format", "json")]), None).unwrap();
        assert!(translated.is_empty());
    }

    #[test]
    fn test_exact_filter_passes_others_rejected() {
        assert!(translate_params(&pairs(&[("postcode", "1011PN")]), None).is_ok());
        assert!(translate_params(&pairs(&[("postcode[exact]", "1011PN")]), None).is_ok());

        let err = translate_params(&pairs(&[("postcode[like]", "1011*")]), None).unwrap_err();
        assert!(err.to_string().contains("not supported"));
    }

    #[test]
    fn test_filter_allowlist() {
        let allowed = ["postcode", "kadastraleAanduiding"];
        assert!(translate_params(&pairs(&[("postcode", "1011PN")]), Some(&allowed)).is_ok());
        assert!(translate_params(&pairs(&[("bsn", "123456789")]), Some(&allowed)).is_err());
    }
}
