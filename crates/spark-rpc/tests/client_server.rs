//! 客户端适配器经由内存“传输层”直连 `RpcServer` 的端到端行为。

mod support;

use std::sync::Arc;
use std::time::Duration;

use futures::future;
use futures::stream::{self, StreamExt, TryStreamExt};
use parking_lot::Mutex;
use spark_rpc::client_calls::{self, CancelCall};
use spark_rpc::{
    ActiveTracker, BoxError, CallContext, CallOutcome, Code, Interceptor, Metadata,
    MethodHandler, RoutingTable, RpcServer, ServiceDefinition, Status,
    StreamObserver, Streaming,
};
use support::{Event, Recording, eventually};

const ECHO: &str = "demo.Echo";

fn echo_service() -> ServiceDefinition<String> {
    ServiceDefinition::builder(ECHO)
        .method(
            "EchoUnary",
            MethodHandler::unary(|text: String| async move { Ok::<_, Status>(text.to_uppercase()) }),
        )
        .method(
            "FailFast",
            MethodHandler::unary(|_text: String| async move {
                Err::<String, BoxError>("boom".into())
            }),
        )
        .method(
            "CountUp",
            MethodHandler::server_streaming(|limit: String| {
                let limit = limit.parse::<u32>().unwrap_or(0);
                stream::iter((0..limit).map(|i| Ok::<_, Status>(i.to_string())))
            }),
        )
        .method(
            "Forever",
            MethodHandler::server_streaming(|_request: String| {
                stream::unfold(0u32, |next| async move {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    Some((Ok::<_, Status>(next.to_string()), next + 1))
                })
            }),
        )
        .method(
            "Stall",
            MethodHandler::unary(|_text: String| future::pending::<Result<String, Status>>()),
        )
        .method(
            "Join",
            MethodHandler::client_streaming(|parts: Streaming<String>| async move {
                let parts: Vec<String> = parts.try_collect().await?;
                Ok::<_, Status>(parts.join(","))
            }),
        )
        .method(
            "Shout",
            MethodHandler::bidi_streaming(|words: Streaming<String>| {
                words.map_ok(|word| word.to_uppercase())
            }),
        )
        .build()
}

fn server_with(interceptors: Vec<Arc<dyn Interceptor>>) -> Arc<RpcServer<String>> {
    let server = RpcServer::new(support::executor(), Arc::new(ActiveTracker::new()));
    let builder = interceptors
        .into_iter()
        .fold(RoutingTable::builder().service(echo_service()), |builder, i| {
            builder.interceptor(i)
        });
    server
        .publish(builder.build().expect("合法的路由表"))
        .expect("首次发布");
    Arc::new(server)
}

fn method(name: &str) -> String {
    format!("{ECHO}/{name}")
}

/// 单值入站调用：受理、推送请求、半关闭；取消入口转交给服务端调用。
fn unary_delegate(
    server: &Arc<RpcServer<String>>,
    method: String,
    metadata: Metadata,
) -> impl FnOnce(String, Arc<dyn StreamObserver<String>>) -> CancelCall {
    let server = Arc::clone(server);
    move |request: String, responses: Arc<dyn StreamObserver<String>>| -> CancelCall {
        match server.start_call(&method, metadata, Arc::clone(&responses)) {
            Ok(call) => {
                let requests = call.request_observer();
                requests.on_next(request);
                requests.on_completed();
                Box::new(move || call.cancel())
            }
            Err(status) => {
                responses.on_error(status);
                Box::new(|| {})
            }
        }
    }
}

/// 序列入站调用：受理后把入站推送通道交还给客户端适配器。
fn streaming_delegate(
    server: &Arc<RpcServer<String>>,
    method: String,
) -> impl FnOnce(Arc<dyn StreamObserver<String>>) -> Arc<dyn StreamObserver<String>> {
    let server = Arc::clone(server);
    move |responses: Arc<dyn StreamObserver<String>>| -> Arc<dyn StreamObserver<String>> {
        match server.start_call(&method, Metadata::new(), Arc::clone(&responses)) {
            Ok(call) => call.request_observer(),
            Err(status) => {
                responses.on_error(status);
                Recording::<String>::new().observer()
            }
        }
    }
}

#[tokio::test]
async fn echo_unary_round_trip() {
    let server = server_with(Vec::new());
    let reply = client_calls::one_to_one(
        String::from("hello"),
        unary_delegate(&server, method("EchoUnary"), Metadata::new()),
    )
    .await;
    assert_eq!(reply, Ok(String::from("HELLO")));
}

#[tokio::test]
async fn fail_fast_surfaces_unknown_with_description() {
    let server = server_with(Vec::new());
    let reply = client_calls::one_to_one(
        String::new(),
        unary_delegate(&server, method("FailFast"), Metadata::new()),
    )
    .await;
    assert_eq!(reply, Err(Status::unknown("boom")));
}

#[tokio::test]
async fn unknown_method_is_unimplemented() {
    let server = server_with(Vec::new());
    let reply = client_calls::one_to_one(
        String::new(),
        unary_delegate(&server, method("Nope"), Metadata::new()),
    )
    .await;
    assert_eq!(reply.map_err(|status| status.code()), Err(Code::Unimplemented));
}

#[tokio::test]
async fn count_up_streams_in_order() {
    let server = server_with(Vec::new());
    let responses = client_calls::one_to_many(
        String::from("3"),
        unary_delegate(&server, method("CountUp"), Metadata::new()),
    );
    let items: Vec<String> = responses.try_collect().await.expect("序列正常完成");
    assert_eq!(items, vec!["0", "1", "2"]);
    eventually(|| server.tracker().is_empty()).await;
}

#[tokio::test]
async fn dropping_client_stream_stops_server_producer() {
    let server = server_with(Vec::new());
    let mut responses = client_calls::one_to_many(
        String::new(),
        unary_delegate(&server, method("Forever"), Metadata::new()),
    );
    assert_eq!(responses.next().await, Some(Ok(String::from("0"))));
    assert_eq!(server.tracker().len(), 1);

    drop(responses);
    eventually(|| server.tracker().is_empty()).await;
}

#[tokio::test]
async fn dropping_pending_unary_response_cancels_server_call() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let server = server_with(audit_chain(&log));
    let metadata: Metadata = [("x-tenant", "acme")].into_iter().collect();

    let response = client_calls::one_to_one(
        String::from("wait"),
        unary_delegate(&server, method("Stall"), metadata),
    );
    support::settle().await;
    drop(response);

    eventually(|| log.lock().len() == 4).await;
    assert_eq!(
        log.lock().as_slice(),
        [
            "enter:trace",
            "enter:tenant",
            "close:tenant:Cancelled",
            "close:trace:Cancelled"
        ]
    );
}

#[tokio::test]
async fn client_streaming_round_trip() {
    let server = server_with(Vec::new());
    let requests = stream::iter(
        ["a", "b", "c"]
            .into_iter()
            .map(|part| Ok::<_, Status>(part.to_owned())),
    );
    let joined =
        client_calls::many_to_one(requests, streaming_delegate(&server, method("Join"))).await;
    assert_eq!(joined, Ok(String::from("a,b,c")));
}

#[tokio::test]
async fn bidi_round_trip() {
    let server = server_with(Vec::new());
    let requests = stream::iter(vec![
        Ok::<_, Status>(String::from("ping")),
        Ok(String::from("pong")),
    ]);
    let responses =
        client_calls::many_to_many(requests, streaming_delegate(&server, method("Shout")));
    let words: Vec<String> = responses.try_collect().await.expect("序列正常完成");
    assert_eq!(words, vec!["PING", "PONG"]);
    eventually(|| server.tracker().is_empty()).await;
}

#[tokio::test]
async fn dropping_bidi_client_cancels_request_side() {
    let request_side = Recording::<String>::new();
    let observer = request_side.observer();
    let responses = client_calls::many_to_many(
        stream::pending::<Result<String, Status>>(),
        move |_responses: Arc<dyn StreamObserver<String>>| observer,
    );
    drop(responses);

    assert_eq!(
        request_side.events(),
        vec![Event::Error(Status::cancelled("client dropped the call"))]
    );
}

#[tokio::test]
async fn half_close_without_request_is_internal() {
    let server = server_with(Vec::new());
    let transport = Recording::<String>::new();
    let call = server
        .start_call(&method("EchoUnary"), Metadata::new(), transport.observer())
        .expect("方法存在");

    call.request_observer().on_completed();
    assert_eq!(
        transport.wait_terminal().await,
        vec![Event::Error(Status::internal("half-closed without a request"))]
    );
}

#[tokio::test]
async fn second_request_on_unary_inbound_is_internal() {
    let server = server_with(Vec::new());
    let transport = Recording::<String>::new();
    let call = server
        .start_call(&method("EchoUnary"), Metadata::new(), transport.observer())
        .expect("方法存在");

    let requests = call.request_observer();
    requests.on_next(String::from("one"));
    requests.on_next(String::from("two"));
    requests.on_completed();
    assert_eq!(
        transport.wait_terminal().await,
        vec![Event::Error(Status::internal("too many requests"))]
    );
}

struct Audit {
    label: &'static str,
    priority: i32,
    log: Arc<Mutex<Vec<String>>>,
}

impl Interceptor for Audit {
    fn name(&self) -> &str {
        self.label
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn on_request(&self, ctx: &mut CallContext) -> Result<(), Status> {
        self.log.lock().push(format!("enter:{}", self.label));
        if self.label == "tenant" && ctx.metadata().get("x-tenant").is_none() {
            return Err(Status::permission_denied("missing tenant"));
        }
        Ok(())
    }

    fn on_close(&self, _ctx: &CallContext, outcome: &CallOutcome) {
        self.log
            .lock()
            .push(format!("close:{}:{:?}", self.label, outcome));
    }
}

fn audit_chain(log: &Arc<Mutex<Vec<String>>>) -> Vec<Arc<dyn Interceptor>> {
    vec![
        Arc::new(Audit {
            label: "tenant",
            priority: 1,
            log: Arc::clone(log),
        }),
        Arc::new(Audit {
            label: "trace",
            priority: 0,
            log: Arc::clone(log),
        }),
    ]
}

#[tokio::test]
async fn interceptors_wrap_the_call_in_priority_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let server = server_with(audit_chain(&log));
    let metadata: Metadata = [("x-tenant", "acme")].into_iter().collect();

    let reply = client_calls::one_to_one(
        String::from("hi"),
        unary_delegate(&server, method("EchoUnary"), metadata),
    )
    .await;
    assert_eq!(reply, Ok(String::from("HI")));

    eventually(|| log.lock().len() == 4).await;
    assert_eq!(
        log.lock().as_slice(),
        [
            "enter:trace",
            "enter:tenant",
            "close:tenant:Completed",
            "close:trace:Completed"
        ]
    );
}

#[tokio::test]
async fn rejecting_interceptor_stops_the_call() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let server = server_with(audit_chain(&log));

    let reply = client_calls::one_to_one(
        String::from("hi"),
        unary_delegate(&server, method("EchoUnary"), Metadata::new()),
    )
    .await;
    assert_eq!(reply, Err(Status::permission_denied("missing tenant")));
    assert_eq!(
        log.lock().as_slice(),
        [
            "enter:trace",
            "enter:tenant",
            "close:trace:Failed(Status { code: PermissionDenied, message: \"missing tenant\" })"
        ]
    );
}

#[tokio::test]
async fn cancel_before_half_close_reports_cancelled_outcome() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let server = server_with(audit_chain(&log));
    let transport = Recording::<String>::new();
    let metadata: Metadata = [("x-tenant", "acme")].into_iter().collect();

    let call = server
        .start_call(&method("EchoUnary"), metadata, transport.observer())
        .expect("受理成功");
    call.request_observer().on_next(String::from("never finished"));
    call.cancel();
    call.request_observer().on_completed();

    support::settle().await;
    assert!(transport.events().is_empty(), "取消后不得再推送任何信号");
    assert_eq!(
        log.lock().as_slice(),
        [
            "enter:trace",
            "enter:tenant",
            "close:tenant:Cancelled",
            "close:trace:Cancelled"
        ]
    );
}
