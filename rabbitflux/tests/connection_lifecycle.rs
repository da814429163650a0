//! Process-wide connection lifecycle.
//!
//! `stop_all` tears down the connection shared by every service in the
//! process, so the whole lifecycle runs as a single test in its own binary.

use rabbitflux::{
    ConnectionConfig, ConnectionManager, FluxError, Outcome, Request, Resolution, Response, Service, ServiceConfig,
    ServiceState,
};
use std::sync::Arc;

fn echo(name: &str, url: &str) -> Service {
    Service::new(name, ServiceConfig::new(url).with_timeout_ms(500), |request: Request, _: &Service| {
        Outcome::Respond(Response::ok(request.path))
    })
}

fn round_trip(service: &Service) -> Resolution {
    service
        .send_request_to_service(service.name(), &Request::to_path("/ping"))
        .unwrap()
}

#[test]
fn test_shared_connection_lifecycle() {
    // malformed addresses never reach the connection manager
    let err = ConnectionManager::ensure_started(&ConnectionConfig::new("bad_uri", 4)).unwrap_err();
    assert!(matches!(err, FluxError::Validation(_)));
    assert!(!ConnectionManager::is_running());

    let broken = echo("lifecycle.broken", "bad_uri");
    assert!(matches!(broken.start(), Err(FluxError::Validation(_))));
    assert_eq!(broken.state(), ServiceState::Stopped);
    assert!(!ConnectionManager::is_running());

    // nothing listens on port 1
    let unreachable = ConnectionConfig {
        connection_timeout_ms: 2_000,
        ..ConnectionConfig::new("amqp://127.0.0.1:1", 4)
    };
    let err = ConnectionManager::ensure_started(&unreachable).unwrap_err();
    assert!(matches!(err, FluxError::Connection(_)), "got {err:?}");
    assert!(!ConnectionManager::is_running());

    // the first start brings the connection up, later ones share it
    let first = echo("lifecycle.first", "memory://lifecycle");
    let second = echo("lifecycle.second", "memory://elsewhere");
    first.start().unwrap();
    assert!(ConnectionManager::is_running());
    second.start().unwrap();
    let shared = ConnectionManager::current().unwrap();
    assert_eq!(shared.address().to_string(), "memory://lifecycle");

    let resolution = round_trip(&first);
    assert_eq!(resolution.response().and_then(Response::body_str), Some("/ping"));
    let resolution = first
        .send_request_to_service(second.name(), &Request::to_path("/pong"))
        .unwrap();
    assert_eq!(resolution.response().and_then(Response::body_str), Some("/pong"));

    // stopping one service leaves the connection to the others
    second.stop().unwrap();
    assert!(ConnectionManager::is_running());
    assert!(round_trip(&first).response().is_some());

    // stop_all takes the connection away from every service
    ConnectionManager::stop_all();
    assert!(!ConnectionManager::is_running());
    assert!(!shared.is_open());
    assert!(matches!(
        first.send_request_to_service(first.name(), &Request::new()),
        Err(FluxError::Connection(_))
    ));
    ConnectionManager::stop_all();

    // a stale service still stops cleanly and can start over on a fresh connection
    first.stop().unwrap();
    assert_eq!(first.state(), ServiceState::Stopped);
    first.start().unwrap();
    assert!(ConnectionManager::is_running());
    assert!(round_trip(&first).response().is_some());

    // a connection the broker dropped is replaced by the next start
    let lost = ConnectionManager::current().unwrap();
    let broker = lost.broker();
    lost.block_on(async move { broker.close().await }).unwrap().unwrap();
    assert!(!lost.is_open());
    assert!(matches!(
        first.send_request_to_service(first.name(), &Request::new()),
        Err(FluxError::Connection(_))
    ));

    first.stop().unwrap();
    first.start().unwrap();
    let replaced = ConnectionManager::current().unwrap();
    assert!(!Arc::ptr_eq(&lost, &replaced));
    assert!(replaced.is_open());
    assert_eq!(replaced.address().to_string(), "memory://lifecycle");
    assert!(round_trip(&first).response().is_some());

    first.stop().unwrap();
    ConnectionManager::stop_all();
    assert!(!ConnectionManager::is_running());
}
