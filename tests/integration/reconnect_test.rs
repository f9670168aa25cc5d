use std::time::Duration;

use de_messaging::{
    Client, ClientOptions, ClientState, ExchangeKind, MessagingError, ReconnectPolicy,
};

use crate::common::{self, EXCHANGE};

async fn wait_for_reconnect(client: &Client) {
    let mut state = client.watch_state();
    state.borrow_and_update();
    client.force_reconnect().await.unwrap();

    tokio::time::timeout(common::WAIT, async {
        state.changed().await.unwrap();
        state.wait_for(|s| *s == ClientState::Connected).await.unwrap();
    })
    .await
    .expect("client should reconnect");
}

#[tokio::test]
#[ignore] // Requires a running RabbitMQ instance
async fn consumers_are_replayed_after_reconnect() {
    let options = ClientOptions::new(&common::amqp_uri(), true)
        .with_reconnect_policy(ReconnectPolicy::fixed(Duration::from_millis(200)));
    let client = Client::with_options(options).await.unwrap();
    client.setup_publishing(EXCHANGE).await.unwrap();

    let run = common::unique("replay");
    let mut bindings = Vec::new();
    for i in 0..3 {
        let (handler, rx) = common::collector();
        let queue = format!("{}-{}", run, i);
        let key = format!("tests.{}.{}", run, i);
        client
            .add_consumer_with(EXCHANGE, ExchangeKind::Topic, &queue, &key, handler, 1)
            .await
            .unwrap();
        bindings.push((queue, key, rx));
    }

    let listener = client.clone();
    let listening = tokio::spawn(async move { listener.listen().await });

    for (_, key, rx) in bindings.iter_mut() {
        client.publish(key, b"before").await.unwrap();
        assert_eq!(common::next_body(rx).await, b"before");
    }

    wait_for_reconnect(&client).await;
    assert_eq!(client.consumers().await.len(), 3);

    for (_, key, rx) in bindings.iter_mut() {
        client.publish(key, b"after").await.unwrap();
        assert_eq!(common::next_body(rx).await, b"after");
        common::assert_quiet(rx).await;
    }

    client.close().await.unwrap();
    assert!(listening.await.unwrap().is_ok());

    let queues: Vec<String> = bindings.into_iter().map(|(queue, _, _)| queue).collect();
    common::cleanup(&queues).await;
}

#[tokio::test]
#[ignore]
async fn disabled_reconnect_surfaces_loss() {
    let client = Client::connect(&common::amqp_uri(), false).await.unwrap();
    client.setup_publishing(EXCHANGE).await.unwrap();

    let listener = client.clone();
    let listening = tokio::spawn(async move { listener.listen().await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    client.force_reconnect().await.unwrap();
    let result = tokio::time::timeout(common::WAIT, listening)
        .await
        .expect("listener should stop")
        .unwrap();

    assert!(matches!(result, Err(MessagingError::ConnectionError(_))));
    assert_eq!(client.state(), ClientState::Disconnected);
    assert!(client.publish("tests", b"lost").await.is_err());

    client.close().await.unwrap();
}

/// Publishes to `key` until the handler sees `body`, for bindings that are
/// still being re-declared when the first message goes out.
async fn publish_until_received(
    client: &Client,
    key: &str,
    body: &[u8],
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>,
) {
    tokio::time::timeout(common::WAIT, async {
        loop {
            if client.publish(key, body).await.is_ok() {
                if let Ok(Some(received)) =
                    tokio::time::timeout(Duration::from_millis(500), rx.recv()).await
                {
                    if received == body {
                        break;
                    }
                }
            } else {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    })
    .await
    .expect("message should be delivered");
}

#[tokio::test]
#[ignore]
async fn consumer_restarts_after_its_queue_is_deleted() {
    let options = ClientOptions::new(&common::amqp_uri(), true)
        .with_reconnect_policy(ReconnectPolicy::fixed(Duration::from_millis(200)));
    let client = Client::with_options(options).await.unwrap();
    client.setup_publishing(EXCHANGE).await.unwrap();

    let queue = common::unique("cancelled");
    let key = format!("tests.{}", queue);
    let (handler, mut rx) = common::collector();
    client
        .add_consumer_with(EXCHANGE, ExchangeKind::Topic, &queue, &key, handler, 1)
        .await
        .unwrap();

    let listener = client.clone();
    let listening = tokio::spawn(async move { listener.listen().await });

    client.publish(&key, b"before").await.unwrap();
    assert_eq!(common::next_body(&mut rx).await, b"before");

    // The broker cancels the consumer; the listener re-declares and resumes.
    client.delete_queue(&queue).await.unwrap();
    publish_until_received(&client, &key, b"after", &mut rx).await;

    assert_eq!(client.state(), ClientState::Connected);
    assert_eq!(client.consumers().await.len(), 1);

    client.close().await.unwrap();
    assert!(listening.await.unwrap().is_ok());
    common::cleanup(&[queue]).await;
}

#[tokio::test]
#[ignore]
async fn control_channel_recovers_from_a_refused_declare() {
    let client = common::client().await;
    let listener = client.clone();
    let listening = tokio::spawn(async move { listener.listen().await });

    // Re-declaring the topic exchange as direct makes the broker close the channel.
    let refused = client.setup_publishing_with_kind(EXCHANGE, ExchangeKind::Direct).await;
    assert!(matches!(refused, Err(MessagingError::ExchangeError(_))));

    let published = tokio::time::timeout(common::WAIT, async {
        loop {
            if client.publish("tests.recovered", b"again").await.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await;
    assert!(published.is_ok(), "publishing should work once the channel is reopened");
    assert_eq!(client.state(), ClientState::Connected);

    client.close().await.unwrap();
    assert!(listening.await.unwrap().is_ok());
}

#[tokio::test]
#[ignore]
async fn refused_queue_checks_do_not_exhaust_channels() {
    use de_messaging::options::QueueDeclareOptions;
    use lapin::types::FieldTable;

    let owner = common::client().await;
    let queue = common::unique("locked");
    let owner_queue = common::unique("owner");
    let channel = owner
        .create_queue(&owner_queue, EXCHANGE, "tests.owner", false, true)
        .await
        .unwrap();
    channel
        .queue_declare(
            &queue,
            QueueDeclareOptions {
                exclusive: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .unwrap();

    // More checks than the broker's default channel_max of 2047.
    let client = common::client().await;
    for _ in 0..2100 {
        let checked = client.queue_exists(&queue, false, false).await;
        assert!(matches!(checked, Err(MessagingError::QueueError(_))));
    }
    assert!(!client
        .queue_exists(&common::unique("absent"), true, false)
        .await
        .unwrap());

    client.close().await.unwrap();
    owner.delete_queue(&owner_queue).await.unwrap();
    owner.close().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn broker_side_disconnect_replays_consumers() {
    let proxy = proxy::KillableProxy::start(&common::amqp_uri()).await;
    let options = ClientOptions::new(proxy.uri(), true)
        .with_reconnect_policy(ReconnectPolicy::fixed(Duration::from_millis(200)));
    let client = Client::with_options(options).await.unwrap();
    client.setup_publishing(EXCHANGE).await.unwrap();

    let queue = common::unique("severed");
    let key = format!("tests.{}", queue);
    let (handler, mut rx) = common::collector();
    client
        .add_consumer_with(EXCHANGE, ExchangeKind::Topic, &queue, &key, handler, 1)
        .await
        .unwrap();

    let listener = client.clone();
    let listening = tokio::spawn(async move { listener.listen().await });

    client.publish(&key, b"before").await.unwrap();
    assert_eq!(common::next_body(&mut rx).await, b"before");

    let mut state = client.watch_state();
    state.borrow_and_update();
    proxy.sever();

    tokio::time::timeout(common::WAIT, async {
        state.changed().await.unwrap();
        state.wait_for(|s| *s == ClientState::Connected).await.unwrap();
    })
    .await
    .expect("client should reconnect through the proxy");

    publish_until_received(&client, &key, b"after", &mut rx).await;

    client.close().await.unwrap();
    assert!(listening.await.unwrap().is_ok());
    common::cleanup(&[queue]).await;
}

mod proxy {
    use lapin::uri::AMQPUri;
    use tokio::io::copy_bidirectional;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::watch;

    /// TCP relay in front of the broker that can drop every live connection
    /// at once, the way a broker restart or a network cut would.
    pub struct KillableProxy {
        uri: String,
        severed: watch::Sender<u64>,
    }

    impl KillableProxy {
        pub async fn start(broker_uri: &str) -> Self {
            let parsed: AMQPUri = broker_uri.parse().expect("broker uri should parse");
            let upstream = format!("{}:{}", parsed.authority.host, parsed.authority.port);

            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let local = listener.local_addr().unwrap();
            let uri = format!(
                "amqp://{}:{}@{}/{}",
                parsed.authority.userinfo.username,
                parsed.authority.userinfo.password,
                local,
                parsed.vhost.replace('/', "%2f"),
            );

            let (severed, watcher) = watch::channel(0u64);
            tokio::spawn(async move {
                while let Ok((inbound, _)) = listener.accept().await {
                    let upstream = upstream.clone();
                    let mut sever = watcher.clone();
                    // Only a sever after this connection was accepted applies.
                    sever.borrow_and_update();
                    tokio::spawn(async move {
                        let mut inbound = inbound;
                        let mut outbound = match TcpStream::connect(&upstream).await {
                            Ok(stream) => stream,
                            Err(_) => return,
                        };
                        tokio::select! {
                            _ = copy_bidirectional(&mut inbound, &mut outbound) => {}
                            _ = sever.changed() => {}
                        }
                    });
                }
            });

            Self { uri, severed }
        }

        pub fn uri(&self) -> &str {
            &self.uri
        }

        /// Drops every connection relayed so far; new ones are still accepted.
        pub fn sever(&self) {
            self.severed.send_modify(|count| *count += 1);
        }
    }
}
