//! The real `reqwest` target against a minimal local HTTP server.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde_json::json;

use payload_evolver::evolution::{HttpTarget, ReqwestTarget, TransportError};
use payload_evolver::schema::{
    AuthConfig, EvaluationConfig, FitnessBands, PopulationConfig, ResponseClass, RunConfig,
};
use payload_evolver::DiscoveryDriver;

/// Serve one canned response per accepted connection and return the raw
/// requests once all responses are sent.
fn serve(responses: Vec<(u16, String)>) -> (String, JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = thread::spawn(move || {
        let mut requests = Vec::new();
        for (status, body) in responses {
            let (mut stream, _) = listener.accept().unwrap();
            requests.push(read_request(&mut stream));
            let response = format!(
                "HTTP/1.1 {status} Canned\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).unwrap();
        }
        requests
    });

    (format!("http://{addr}"), handle)
}

fn read_request(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..end]).to_lowercase();
            let length = head
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= end + 4 + length {
                break;
            }
        }
    }
    String::from_utf8_lossy(&buf).to_string()
}

/// Accept connections and hold them open without ever answering.
fn stalled_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        let mut held = Vec::new();
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => held.push(stream),
                Err(_) => break,
            }
        }
    });
    format!("http://{addr}/api/users")
}

fn closed_port_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("http://127.0.0.1:{port}/api/users")
}

#[test]
fn test_reqwest_target_posts_json() {
    let (base, server) = serve(vec![(500, r#"{"error": "database is locked"}"#.to_string())]);
    let config = EvaluationConfig {
        target_url: format!("{base}/api/users"),
        timeout_ms: 5_000,
        ..Default::default()
    };

    let target = ReqwestTarget::new(&config).unwrap();
    let response = target.send(br#"{"name":"alice"}"#).unwrap();
    assert_eq!(response.status, 500);
    assert!(response.body.contains("database is locked"));

    let requests = server.join().unwrap();
    let request = requests[0].to_lowercase();
    assert!(request.starts_with("post /api/users"));
    assert!(request.contains("content-type: application/json"));
    assert!(request.ends_with(r#"{"name":"alice"}"#));
}

#[test]
fn test_bearer_login_attaches_token() {
    let (base, server) = serve(vec![
        (200, r#"{"access_token": "abc123"}"#.to_string()),
        (201, r#"{"id": 1}"#.to_string()),
    ]);
    let config = EvaluationConfig {
        target_url: format!("{base}/api/users"),
        timeout_ms: 5_000,
        auth: Some(AuthConfig {
            token_url: format!("{base}/api/token"),
            credentials: json!({"username": "admin", "password": "secret"}),
            token_field: "access_token".to_string(),
        }),
        ..Default::default()
    };

    let target = ReqwestTarget::from_config(&config).unwrap();
    let response = target.send(b"{}").unwrap();
    assert_eq!(response.status, 201);

    let requests = server.join().unwrap();
    assert!(requests[0].to_lowercase().starts_with("post /api/token"));
    assert!(requests[0].contains("\"username\":\"admin\""));
    assert!(requests[1].to_lowercase().contains("authorization: bearer abc123"));
}

#[test]
fn test_failed_login_is_reported() {
    let (base, server) = serve(vec![(401, r#"{"error": "invalid credentials"}"#.to_string())]);
    let config = EvaluationConfig {
        target_url: format!("{base}/api/users"),
        auth: Some(AuthConfig {
            token_url: format!("{base}/api/token"),
            credentials: json!({}),
            token_field: "access_token".to_string(),
        }),
        ..Default::default()
    };

    assert!(matches!(
        ReqwestTarget::from_config(&config),
        Err(TransportError::Auth(_))
    ));
    server.join().unwrap();
}

#[test]
fn test_closed_port_run_scores_lowest_band() {
    let mut config = RunConfig {
        population: PopulationConfig {
            size: 4,
            max_generations: 2,
            ..Default::default()
        },
        random_seed: Some(9),
        ..RunConfig::user_api_example()
    };
    config.evaluation.target_url = closed_port_url();
    config.evaluation.timeout_ms = 2_000;

    let mut driver = DiscoveryDriver::from_config(config).unwrap();
    let report = driver.run().unwrap();

    assert_eq!(report.stats.generations, 2);
    assert_eq!(report.best.fitness, 0.0);
    assert!(
        report
            .top
            .iter()
            .all(|entry| entry.tags.iter().any(|t| t == "network-failure" || t == "timeout"))
    );
}

#[test]
fn test_hung_call_times_out_within_bound() {
    let config = EvaluationConfig {
        target_url: stalled_server(),
        timeout_ms: 300,
        ..Default::default()
    };
    let target = ReqwestTarget::new(&config).unwrap();

    let start = Instant::now();
    let result = target.send(br#"{"name":"alice"}"#);
    let elapsed = start.elapsed();

    assert_eq!(result, Err(TransportError::Timeout(Duration::from_millis(300))));
    assert!(elapsed >= Duration::from_millis(250), "returned early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "hung for {elapsed:?}");
}

#[test]
fn test_hung_target_run_scores_failure_band() {
    let mut config = RunConfig {
        population: PopulationConfig {
            size: 4,
            max_generations: 1,
            ..Default::default()
        },
        random_seed: Some(11),
        ..RunConfig::user_api_example()
    };
    config.evaluation.target_url = stalled_server();
    config.evaluation.timeout_ms = 300;

    let start = Instant::now();
    let mut driver = DiscoveryDriver::from_config(config).unwrap();
    let report = driver.run().unwrap();

    assert!(start.elapsed() < Duration::from_secs(30));
    assert_eq!(report.stats.generations, 1);
    assert_eq!(report.best.fitness, FitnessBands::default().failure);
    for entry in &report.top {
        let diagnostics = entry.diagnostics.as_ref().unwrap();
        assert_eq!(diagnostics.class, ResponseClass::NetworkFailure);
        assert!(diagnostics.timed_out);
        assert!(entry.tags.iter().any(|t| t == "timeout"));
    }
}
