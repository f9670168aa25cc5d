// Broker-backed tests. They need a running RabbitMQ:
//
//   RUN_INTEGRATION_TESTS=1 cargo test --test integration -- --ignored
//
// INTEGRATION_TEST_AMQP_URI overrides the default broker address.

mod common;
mod connection_test;
mod publish_test;
mod queue_test;
mod reconnect_test;
