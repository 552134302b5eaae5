use crate::api;
use crate::cli::{actions::Action, globals::GlobalArgs};
use anyhow::Result;
use secrecy::SecretString;

/// Handle the server action
pub async fn handle(action: Action) -> Result<()> {
    match action {
        Action::Server {
            port,
            identity_url,
            identity_token,
            frontend_url,
        } => {
            let globals = GlobalArgs::new(
                identity_url,
                SecretString::from(identity_token),
                frontend_url,
            );

            api::new(port, &globals).await?;
        }
    }

    Ok(())
}
