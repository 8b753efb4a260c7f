use std::time::Duration;

use postline::{Client, Result};

pub async fn main() -> Result<()> {
    let listener = Client::connect_env().await?;
    let notifier = Client::connect_env().await?;

    listener.listen("test").await?;
    notifier.notify("test", "hello").await?;

    let notification = tokio::time::timeout(Duration::from_secs(5), listener.recv_notification())
        .await
        .expect("notification timed out")
        .expect("listener closed");

    assert_eq!(notification.channel, "test");
    assert_eq!(notification.payload, "hello");

    listener.unlisten("test").await?;
    Ok(())
}
