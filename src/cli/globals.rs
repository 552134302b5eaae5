use secrecy::SecretString;

#[derive(Debug, Clone)]
pub struct GlobalArgs {
    pub identity_url: String,
    pub identity_token: SecretString,
    pub frontend_url: String,
}

impl GlobalArgs {
    #[must_use]
    pub fn new(identity_url: String, identity_token: SecretString, frontend_url: String) -> Self {
        Self {
            identity_url,
            identity_token,
            frontend_url,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn test_global_args() {
        let args = GlobalArgs::new(
            "https://identity.tld:8443".to_string(),
            SecretString::from("svc-token".to_string()),
            "https://portal.tld".to_string(),
        );
        assert_eq!(args.identity_url, "https://identity.tld:8443");
        assert_eq!(args.identity_token.expose_secret(), "svc-token");
        assert_eq!(args.frontend_url, "https://portal.tld");
    }
}
