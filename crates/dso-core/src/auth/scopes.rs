//! The per-request authorization context.

use std::collections::BTreeSet;

/// The verified scope set of a request, plus the query parameters present.
///
/// Constructed once per request by the middleware contract (token validation
/// itself is out of scope, an upstream component supplies the scopes) and
/// immutable afterwards. The query parameter names feed profile
/// mandatory-filter-set matching.
#[derive(Debug, Clone, Default)]
pub struct UserScopes {
    granted:      BTreeSet<String>,
    query_params: BTreeSet<String>,
}

impl UserScopes {
    /// Build the context from granted scopes and present query keys.
    #[must_use]
    pub fn new(
        granted: impl IntoIterator<Item = String>,
        query_params: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            granted:      granted.into_iter().collect(),
            query_params: query_params.into_iter().collect(),
        }
    }

    /// Add extra query parameter names.
    ///
    /// Detail views call this with the table's identifier fields: the `{id}`
    /// in the URL counts as a filter for mandatory-filter-set matching.
    pub fn add_query_params(&mut self, params: impl IntoIterator<Item = String>) {
        self.query_params.extend(params);
    }

    /// Whether all of `required` are granted.
    #[must_use]
    pub fn has_all_scopes(&self, required: &BTreeSet<String>) -> bool {
        required.iter().all(|scope| self.granted.contains(scope))
    }

    /// The granted scopes.
    #[must_use]
    pub fn granted(&self) -> &BTreeSet<String> {
        &self.granted
    }

    /// The query parameter names present on the request.
    #[must_use]
    pub fn query_params(&self) -> &BTreeSet<String> {
        &self.query_params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_all_scopes() {
        let user = UserScopes::new(
            ["FP/MDW".to_string(), "BRK/RS".to_string()],
            [],
        );
        let mut required = BTreeSet::new();
        assert!(user.has_all_scopes(&required));

        required.insert("FP/MDW".to_string());
        assert!(user.has_all_scopes(&required));

        required.insert("HR/R".to_string());
        assert!(!user.has_all_scopes(&required));
    }

    #[test]
    fn test_detail_id_becomes_query_param() {
        let mut user = UserScopes::new([], ["naam".to_string()]);
        user.add_query_params(["identificatie".to_string()]);
        assert!(user.query_params().contains("identificatie"));
        assert!(user.query_params().contains("naam"));
    }
}
