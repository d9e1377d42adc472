use std::collections::HashMap;

/// A resolved credential: the role name and its permitted actions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Role {
    pub name: String,
    pub permissions: Vec<String>,
}

/// Static token-to-role lookup, built explicitly and passed to whoever
/// gates operations. Keeping it a plain value (rather than a process-wide
/// table) lets tests run several gates with different configurations at
/// once. The feature and prediction modules never consult this themselves.
#[derive(Debug, Clone, Default)]
pub struct AccessGate {
    roles: HashMap<String, Vec<String>>,
    tokens: HashMap<String, String>,
}

impl AccessGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_role(mut self, name: &str, permissions: &[&str]) -> Self {
        self.roles.insert(
            name.to_string(),
            permissions.iter().map(|p| p.to_string()).collect(),
        );
        self
    }

    pub fn with_token(mut self, token: &str, role: &str) -> Self {
        self.tokens.insert(token.to_string(), role.to_string());
        self
    }

    /// The demo credential table shipped with the reference deployment.
    pub fn demo() -> Self {
        AccessGate::new()
            .with_role("public", &["view_dashboard", "view_fhir_capability"])
            .with_role(
                "health_official",
                &[
                    "view_dashboard",
                    "view_statistics",
                    "view_fhir_capability",
                    "export_data",
                ],
            )
            .with_role(
                "researcher",
                &[
                    "view_dashboard",
                    "view_statistics",
                    "access_api",
                    "export_data",
                    "view_ml_model",
                ],
            )
            .with_role(
                "clinician",
                &[
                    "view_dashboard",
                    "view_statistics",
                    "access_api",
                    "view_fhir_data",
                    "view_ml_model",
                    "use_cdss",
                ],
            )
            .with_role("admin", &["all"])
            .with_token("demo_api_key_public", "public")
            .with_token("demo_api_key_official", "health_official")
            .with_token("demo_api_key_researcher", "researcher")
            .with_token("demo_api_key_clinician", "clinician")
            .with_token("demo_api_key_admin", "admin")
    }

    /// Resolve a presented credential to its role, or None for unknown
    /// tokens.
    pub fn resolve(&self, token: &str) -> Option<Role> {
        let name = self.tokens.get(token)?;
        let permissions = self.roles.get(name)?;
        Some(Role {
            name: name.clone(),
            permissions: permissions.clone(),
        })
    }

    /// Whether a role may perform an action. The `all` permission is an
    /// admin wildcard.
    pub fn is_allowed(&self, role: &str, action: &str) -> bool {
        match self.roles.get(role) {
            Some(permissions) => {
                permissions.iter().any(|p| p == "all" || p == action)
            }
            None => false,
        }
    }
}
