// src/migrate.rs

use secrecy::Secret;
use tracing::info;

use crate::crypto::EncryptionService;
use crate::db::Database;
use crate::error::{AppError, Result};

const PAGE_SIZE: i64 = 500;
const SAMPLE_SIZE: usize = 10;

/// Re-encrypts every stored key value: decrypt with `from` (identity when
/// absent, i.e. plaintext), encrypt with `to` (identity when absent).
///
/// Key hashes are derived from plaintext and stay untouched. Must run with the
/// service stopped; refuses to proceed when a sample of rows does not decrypt
/// under `from`.
pub async fn run_migrate_keys(dsn: &str, from: Option<String>, to: Option<String>) -> Result<u64> {
    if from.is_none() && to.is_none() {
        return Err(AppError::validation(
            "migrate-keys",
            "at least one of --from and --to is required",
        ));
    }

    let from_svc = EncryptionService::new(from.map(Secret::new));
    let to_svc = EncryptionService::new(to.map(Secret::new));

    let db = Database::connect(dsn).await?;

    sample_check(&db, &from_svc).await?;

    let mut migrated: u64 = 0;
    let mut after_id: i64 = 0;
    loop {
        let page = db.key_values_page(after_id, PAGE_SIZE).await?;
        if page.is_empty() {
            break;
        }
        for (id, stored) in &page {
            let plaintext = from_svc.decrypt(stored).map_err(|e| AppError::Encryption {
                message: format!("key {id} does not decrypt under --from: {e}"),
            })?;
            let re_encrypted = to_svc.encrypt(&plaintext)?;
            db.update_key_value(*id, &re_encrypted).await?;
            migrated += 1;
            after_id = *id;
        }
        info!(migrated, "migration progress");
    }

    db.close().await;
    info!(migrated, "key migration finished");
    Ok(migrated)
}

/// Decrypts a small sample before touching anything. A single failure aborts
/// the whole run, leaving the database unmodified.
async fn sample_check(db: &Database, from_svc: &EncryptionService) -> Result<()> {
    if !from_svc.is_encrypting() {
        return Ok(());
    }
    let sample = db.key_values_page(0, SAMPLE_SIZE as i64).await?;
    for (id, stored) in &sample {
        from_svc.decrypt(stored).map_err(|_| AppError::Encryption {
            message: format!(
                "sample check failed at key {id}: database contents are inconsistent with the --from key"
            ),
        })?;
    }
    Ok(())
}
