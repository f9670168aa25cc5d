use de_messaging::MessagingError;

use crate::common::{self, EXCHANGE};

#[tokio::test]
#[ignore] // Requires a running RabbitMQ instance
async fn queue_lifecycle() {
    let client = common::client().await;
    let queue = common::unique("lifecycle");

    assert!(!client.queue_exists(&queue, true, false).await.unwrap());
    // Asking twice proves the first check didn't create it.
    assert!(!client.queue_exists(&queue, true, false).await.unwrap());

    let channel = client
        .create_queue(&queue, EXCHANGE, "tests.lifecycle", true, false)
        .await
        .unwrap();
    assert!(channel.status().connected());
    channel.close(200, "done").await.unwrap();

    assert!(client.queue_exists(&queue, true, false).await.unwrap());

    client.delete_queue(&queue).await.unwrap();
    assert!(!client.queue_exists(&queue, true, false).await.unwrap());

    client.close().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn deleting_a_missing_queue_is_an_error() {
    let client = common::client().await;
    let result = client.delete_queue(&common::unique("never-created")).await;
    assert!(matches!(result, Err(MessagingError::QueueError(_))));
    client.close().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn created_queue_receives_published_messages() {
    let client = common::client().await;
    let queue = common::unique("created");
    let key = format!("tests.{}", queue);

    let channel = client
        .create_queue(&queue, EXCHANGE, &key, false, true)
        .await
        .unwrap();
    client.publish(&key, b"routed").await.unwrap();

    let message = tokio::time::timeout(common::WAIT, async {
        loop {
            if let Some(message) = channel
                .basic_get(&queue, de_messaging::options::BasicGetOptions { no_ack: true })
                .await
                .unwrap()
            {
                break message;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("message should be routed to the created queue");
    assert_eq!(message.delivery.data, b"routed");

    client.delete_queue(&queue).await.unwrap();
    client.close().await.unwrap();
}
