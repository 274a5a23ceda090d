use streamhub::GroupStrategy;
use streamhub_testkit::StreamFactory;

#[tokio::test]
async fn stream_add_happy_path() {
    streamhub_testkit::run_add_happy_path::<StreamFactory>().await;
}

#[tokio::test]
async fn stream_concurrent_calls() {
    streamhub_testkit::run_concurrent_calls::<StreamFactory>().await;
}

#[tokio::test]
async fn stream_fire_and_forget() {
    streamhub_testkit::run_fire_and_forget::<StreamFactory>().await;
}

#[tokio::test]
async fn stream_unknown_method() {
    streamhub_testkit::run_unknown_method::<StreamFactory>().await;
}

#[tokio::test]
async fn stream_handler_errors() {
    streamhub_testkit::run_handler_errors::<StreamFactory>().await;
}

#[tokio::test]
async fn stream_error_detail() {
    streamhub_testkit::run_error_detail::<StreamFactory>().await;
}

#[tokio::test]
async fn stream_client_result() {
    streamhub_testkit::run_client_result::<StreamFactory>().await;
}

#[tokio::test]
async fn stream_client_result_unimplemented() {
    streamhub_testkit::run_client_result_unimplemented::<StreamFactory>().await;
}

#[tokio::test]
async fn stream_dispose_cancels_pending() {
    streamhub_testkit::run_dispose_cancels_pending::<StreamFactory>().await;
}

#[tokio::test]
async fn stream_broadcast_except_sender_concurrent_map() {
    streamhub_testkit::run_broadcast_except_sender::<StreamFactory>(GroupStrategy::ConcurrentMap).await;
}

#[tokio::test]
async fn stream_broadcast_except_sender_copy_on_write() {
    streamhub_testkit::run_broadcast_except_sender::<StreamFactory>(GroupStrategy::CopyOnWrite).await;
}

#[tokio::test]
async fn stream_broadcast_survives_dead_member() {
    streamhub_testkit::run_broadcast_survives_dead_member::<StreamFactory>().await;
}
