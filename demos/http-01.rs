use std::{fs, path::PathBuf, sync::Arc};

use acme_obtain::{
    AccountIdentity, AccountKey, ChallengeProvider, ChallengeType, Client, DirectoryUrl, KeyType,
};
use actix_files::Files;
use actix_web::{App, HttpServer};
use async_trait::async_trait;

const PRIMARY_NAME: &str = "example.org";
const CHALLENGE_DIR: &str = "acme-challenge";

/// Writes `http-01` proofs where the temporary web server serves them from.
struct FileProvider {
    root: PathBuf,
}

#[async_trait]
impl ChallengeProvider for FileProvider {
    async fn present(&self, domain: &str, token: &str, key_auth: &str) -> eyre::Result<()> {
        log::info!("[{domain}] writing proof for token {token}");
        fs::create_dir_all(&self.root)?;
        fs::write(self.root.join(token), key_auth)?;
        Ok(())
    }

    async fn clean_up(&self, _domain: &str, token: &str, _key_auth: &str) -> eyre::Result<()> {
        fs::remove_file(self.root.join(token))?;
        Ok(())
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    // Use `DirectoryUrl::LetsEncrypt` for production uses.
    let url = DirectoryUrl::LetsEncryptStaging;

    // Create temporary Actix Web server for ACME challenge.
    let srv = HttpServer::new(|| {
        App::new().service(Files::new("/.well-known/acme-challenge", CHALLENGE_DIR))
    })
    .bind(("0.0.0.0", 80))?
    .shutdown_timeout(0)
    .run();

    let srv_handle = srv.handle();
    let srv_task = tokio::spawn(srv);

    // Generate an account key. You should write it to disk and load it with
    // `AccountKey::from_pem` afterwards.
    let account_key = AccountKey::generate();
    let identity = AccountIdentity::new(Some("foo@bar.com".to_owned()), account_key);

    let mut client = Client::new(url, identity, KeyType::default()).await?;

    if let Some(tos) = client.tos_url() {
        log::info!("agreeing to terms of service at {tos}");
    }
    let registration = client.register(true).await?;
    log::info!("account registered at {}", registration.uri);

    client.register_provider(
        ChallengeType::Http01,
        Arc::new(FileProvider {
            root: PathBuf::from(CHALLENGE_DIR),
        }),
    );

    // Proves control of the domain, then waits for the certificate.
    let cert = client
        .obtain_certificate(&[PRIMARY_NAME], true, None, false)
        .await?;

    println!("{}", String::from_utf8_lossy(&cert.certificate));
    println!("valid for {} days", cert.valid_days_left()?);

    // Stop temporary server for ACME challenge
    srv_handle.stop(true).await;
    srv_task.await??;

    // Delete acme-challenge dir
    fs::remove_dir_all(CHALLENGE_DIR)?;

    Ok(())
}
