use std::sync::Arc;

use tokio_postgres::{Client, Error, NoTls};

pub async fn connect(connection_string: &str) -> Result<Arc<Client>, Error> {
    let (client, connection) = tokio_postgres::connect(connection_string, NoTls).await?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("POSTGRES connection error: {}", e);
        }
    });
    Ok(Arc::new(client))
}
