//! Destinations loaded from a JSON file at startup.
use std::path::Path;

use hookshot_common::destination::NewDestination;
use hookshot_common::store::{Store, StoreError};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum SeedError {
    #[error("failed to read destinations file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse destinations file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("failed to store destination {name}: {error}")]
    Store { name: String, error: StoreError },
}

/// Insert every destination listed in `path`, unless the store already has active destinations.
/// All entries are validated before any is inserted. Returns how many were inserted.
pub async fn seed_destinations(store: &dyn Store, path: &Path) -> Result<usize, SeedError> {
    if !store
        .active_destinations()
        .await
        .map_err(|error| SeedError::Store {
            name: "*".to_owned(),
            error,
        })?
        .is_empty()
    {
        info!("destinations already present, skipping {}", path.display());
        return Ok(0);
    }

    let contents = tokio::fs::read_to_string(path).await?;
    let destinations: Vec<NewDestination> = serde_json::from_str(&contents)?;

    for destination in &destinations {
        destination
            .validate()
            .map_err(|error| SeedError::Store {
                name: destination.name.clone(),
                error: error.into(),
            })?;
    }

    let count = destinations.len();
    for destination in destinations {
        let name = destination.name.clone();
        let stored = store
            .insert_destination(destination)
            .await
            .map_err(|error| SeedError::Store { name, error })?;
        info!("seeded destination {} ({})", stored.id, stored.name);
    }

    Ok(count)
}
