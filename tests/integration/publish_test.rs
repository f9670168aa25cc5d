use de_messaging::keys;
use de_messaging::message::{
    EmailRequest, JobState, NotificationMessage, StopRequest, TimeLimitDelta, TimeLimitRequest,
    TimeLimitResponse, UpdateMessage, WrappedNotificationMessage,
};
use de_messaging::models::Job;
use de_messaging::{Envelope, ExchangeKind};

use crate::common::{self, EXCHANGE};

#[tokio::test]
#[ignore] // Requires a running RabbitMQ instance
async fn publish_reaches_bound_queue_exactly_once() {
    let client = common::client().await;
    let queue = common::unique("test_queue");
    let (handler, mut rx) = common::collector();

    client
        .add_consumer_with(EXCHANGE, ExchangeKind::Topic, &queue, "tests", handler, 0)
        .await
        .unwrap();
    client.publish("tests", b"this is a test").await.unwrap();

    assert_eq!(common::next_body(&mut rx).await, b"this is a test");
    common::assert_quiet(&mut rx).await;

    client.delete_queue(&queue).await.unwrap();
    client.close().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn stop_request_lands_on_derived_key() {
    let client = common::client().await;
    let (handler, mut rx) = common::collector();
    let queue = keys::stop_queue_name("test");

    client
        .add_consumer_with(
            EXCHANGE,
            ExchangeKind::Topic,
            &queue,
            &keys::stop_request_key("test"),
            handler,
            0,
        )
        .await
        .unwrap();
    client.send_stop_request("test", "test_user", "this is a test").await.unwrap();

    let request = StopRequest::from_payload(&common::next_body(&mut rx).await).unwrap();
    assert_eq!(request.invocation_id, "test");
    assert_eq!(request.username, "test_user");
    assert_eq!(request.reason, "this is a test");

    client.delete_queue(&queue).await.unwrap();
    client.close().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn time_limit_messages_land_on_their_keys() {
    let client = common::client().await;
    let id = common::unique("tl");

    let (request_handler, mut requests) = common::collector();
    let (response_handler, mut responses) = common::collector();
    let (delta_handler, mut deltas) = common::collector();
    client
        .add_consumer_with(
            EXCHANGE,
            ExchangeKind::Topic,
            &keys::time_limit_request_queue_name(&id),
            &keys::time_limit_request_key(&id),
            request_handler,
            0,
        )
        .await
        .unwrap();
    client
        .add_consumer_with(
            EXCHANGE,
            ExchangeKind::Topic,
            &keys::time_limit_responses_queue_name(&id),
            &keys::time_limit_responses_key(&id),
            response_handler,
            0,
        )
        .await
        .unwrap();
    client
        .add_consumer_with(
            EXCHANGE,
            ExchangeKind::Topic,
            &keys::time_limit_delta_queue_name(&id),
            &keys::time_limit_delta_request_key(&id),
            delta_handler,
            0,
        )
        .await
        .unwrap();

    client.send_time_limit_request(&id).await.unwrap();
    client.send_time_limit_response(&id, 60_000).await.unwrap();
    client.send_time_limit_delta(&id, "-1h30m").await.unwrap();

    let request = TimeLimitRequest::from_payload(&common::next_body(&mut requests).await).unwrap();
    assert_eq!(request.invocation_id, id);

    let response = TimeLimitResponse::from_payload(&common::next_body(&mut responses).await).unwrap();
    assert_eq!(response.milliseconds_remaining, 60_000);

    let delta = TimeLimitDelta::from_payload(&common::next_body(&mut deltas).await).unwrap();
    assert_eq!(delta.delta, "-1h30m");

    for queue in [
        keys::time_limit_request_queue_name(&id),
        keys::time_limit_responses_queue_name(&id),
        keys::time_limit_delta_queue_name(&id),
    ] {
        client.delete_queue(&queue).await.unwrap();
    }
    client.close().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn job_update_email_and_notification() {
    let client = common::client().await;
    let user = common::unique("ipcdev");

    let (updates_handler, mut updates) = common::collector();
    let (email_handler, mut emails) = common::collector();
    let (notify_handler, mut notifications) = common::collector();
    let updates_queue = common::unique("updates");
    let email_queue = common::unique("email");
    let notify_queue = common::unique("notify");

    client
        .add_consumer_with(
            EXCHANGE,
            ExchangeKind::Topic,
            &updates_queue,
            keys::UPDATES_KEY,
            updates_handler,
            1,
        )
        .await
        .unwrap();
    client
        .add_consumer_with(
            EXCHANGE,
            ExchangeKind::Topic,
            &email_queue,
            keys::EMAIL_REQUEST_PUBLISHING_KEY,
            email_handler,
            1,
        )
        .await
        .unwrap();
    client
        .add_consumer_with(
            EXCHANGE,
            ExchangeKind::Topic,
            &notify_queue,
            &keys::notification_key(&user),
            notify_handler,
            1,
        )
        .await
        .unwrap();

    let mut update = UpdateMessage {
        job: Some(Job::new("job-1")),
        version: 0,
        state: JobState::Running,
        message: "running".to_string(),
        sent_on: String::new(),
        sender: "integration".to_string(),
    };
    client.publish_job_update(&mut update).await.unwrap();
    assert!(!update.sent_on.is_empty());

    let email = EmailRequest {
        template_name: "analysis_status_change".to_string(),
        subject: "Analysis running".to_string(),
        to_address: "user@example.org".to_string(),
        ..EmailRequest::default()
    };
    client.publish_email_request(&email).await.unwrap();

    let notification = WrappedNotificationMessage {
        total: 1,
        message: NotificationMessage {
            kind: "analysis".to_string(),
            user: user.clone(),
            subject: "Analysis running".to_string(),
            ..NotificationMessage::default()
        },
    };
    client.publish_notification_message(&notification).await.unwrap();

    // Other producers may share jobs.updates; find ours.
    let received = loop {
        let candidate = UpdateMessage::from_payload(&common::next_body(&mut updates).await).unwrap();
        if candidate.sender == "integration" {
            break candidate;
        }
    };
    assert_eq!(received, update);
    assert_eq!(EmailRequest::from_payload(&common::next_body(&mut emails).await).unwrap(), email);
    assert_eq!(
        WrappedNotificationMessage::from_payload(&common::next_body(&mut notifications).await).unwrap(),
        notification
    );

    for queue in [&updates_queue, &email_queue, &notify_queue] {
        client.delete_queue(queue).await.unwrap();
    }
    client.close().await.unwrap();
}
