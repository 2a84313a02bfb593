//! Integration tests for the HTTP control plane

#[cfg(feature = "server")]
mod server_tests {
    use emg_intent_agent::config::{ClassifierMode, Config};
    use emg_intent_agent::control::ControlPlane;
    use emg_intent_agent::core::SharedDecision;
    use emg_intent_agent::dispatch::Dispatcher;
    use emg_intent_agent::serial::{ChannelMode, SharedSignalSource, SimulatedSource};
    use emg_intent_agent::server::{run, ServerConfig};
    use emg_intent_agent::stats::create_shared_stats;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    struct TestServer {
        addr: SocketAddr,
        shutdown_tx: tokio::sync::oneshot::Sender<()>,
        control: ControlPlane,
        _dir: TempDir,
    }

    impl TestServer {
        fn url(&self, path: &str) -> String {
            format!("http://{}{}", self.addr, path)
        }

        fn stop(self) {
            self.control.shutdown();
            let _ = self.shutdown_tx.send(());
        }
    }

    async fn start(configure: impl FnOnce(&mut Config)) -> TestServer {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let mut config = Config {
            data_path: dir.path().to_path_buf(),
            models_path: dir.path().join("models"),
            ..Default::default()
        };
        config.acquisition.sample_rate = 50;
        config.acquisition.recording_duration = Duration::from_millis(300);
        configure(&mut config);

        let source: SharedSignalSource =
            Arc::new(SimulatedSource::new(ChannelMode::Single, 1000).real_time());
        let dispatcher = Dispatcher::new(&config.dispatch, SharedDecision::new());
        let control = ControlPlane::new(config, source, dispatcher, create_shared_stats());

        // Start server on a random port
        let (addr, shutdown_tx) = run(ServerConfig::new(0), control.clone())
            .await
            .expect("Failed to start server");

        // Give server time to start
        tokio::time::sleep(Duration::from_millis(100)).await;

        TestServer {
            addr,
            shutdown_tx,
            control,
            _dir: dir,
        }
    }

    /// Poll /api/status until a non-waiting update arrives.
    async fn next_status(client: &reqwest::Client, server: &TestServer) -> serde_json::Value {
        for _ in 0..200 {
            let body: serde_json::Value = client
                .get(server.url("/api/status"))
                .send()
                .await
                .expect("Failed to send request")
                .json()
                .await
                .expect("Failed to parse JSON");
            if body["status"] != "waiting" {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("no status update arrived");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_health_endpoint() {
        let server = start(|_| {}).await;

        let client = reqwest::Client::new();
        let response = client
            .get(server.url("/health"))
            .send()
            .await
            .expect("Failed to send request");

        assert!(response.status().is_success());

        let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
        assert_eq!(body["status"], "ok");
        assert!(body["version"].as_str().is_some());

        server.stop();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_idle_status_and_prediction() {
        let server = start(|_| {}).await;
        let client = reqwest::Client::new();

        let body: serde_json::Value = client
            .get(server.url("/api/status"))
            .send()
            .await
            .expect("Failed to send request")
            .json()
            .await
            .expect("Failed to parse JSON");
        assert_eq!(body, serde_json::json!({ "status": "waiting" }));

        let body: serde_json::Value = client
            .get(server.url("/api/prediction"))
            .send()
            .await
            .expect("Failed to send request")
            .json()
            .await
            .expect("Failed to parse JSON");
        assert_eq!(body["prediction"], "STAY");
        assert_eq!(body["intent"], "stay");
        assert!(body["changed_at"].is_null());

        server.stop();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_rejected_requests() {
        let server = start(|_| {}).await;
        let client = reqwest::Client::new();

        let response = client
            .post(server.url("/api/record"))
            .json(&serde_json::json!({ "motion": "SIDEWAYS" }))
            .send()
            .await
            .expect("Failed to send request");
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
        let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
        assert_eq!(body["code"], "INVALID_LABEL");

        let response = client
            .post(server.url("/api/start-inference"))
            .send()
            .await
            .expect("Failed to send request");
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
        let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
        assert_eq!(body["code"], "MODEL_NOT_FOUND");

        let response = client
            .post(server.url("/api/stop-recording"))
            .send()
            .await
            .expect("Failed to send request");
        assert_eq!(response.status(), reqwest::StatusCode::CONFLICT);

        let response = client
            .post(server.url("/api/train"))
            .send()
            .await
            .expect("Failed to send request");
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
        let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
        assert_eq!(body["code"], "MISSING_RECORDINGS");
        assert!(body["error"].as_str().unwrap_or("").contains("nyes.csv"));

        server.stop();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_record_then_train() {
        let server = start(|_| {}).await;
        let client = reqwest::Client::new();

        for label in ["YES", "NO"] {
            let response = client
                .post(server.url("/api/record"))
                .json(&serde_json::json!({ "motion": label }))
                .send()
                .await
                .expect("Failed to send request");
            assert!(response.status().is_success());

            let status = next_status(&client, &server).await;
            assert_eq!(status["status"], "success", "unexpected status: {status}");
            assert_eq!(status["label"], label);
        }

        let response = client
            .post(server.url("/api/train"))
            .json(&serde_json::json!({ "name": "nbest" }))
            .send()
            .await
            .expect("Failed to send request");
        assert!(response.status().is_success());
        let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
        assert_eq!(body["status"], "success");
        assert_eq!(body["report"]["classes"], serde_json::json!(["YES", "NO"]));

        // the trained model now loads
        let response = client
            .post(server.url("/api/start-inference"))
            .send()
            .await
            .expect("Failed to send request");
        assert!(response.status().is_success());
        let response = client
            .post(server.url("/api/stop-inference"))
            .send()
            .await
            .expect("Failed to send request");
        assert!(response.status().is_success());

        server.stop();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_simulated_inference_round_trip() {
        let server = start(|config| {
            config.classifier.mode = ClassifierMode::Simulated {
                affirmative_prior: 1.0,
                seed: Some(11),
            };
        })
        .await;
        let client = reqwest::Client::new();

        let response = client
            .post(server.url("/api/start-inference"))
            .send()
            .await
            .expect("Failed to send request");
        assert!(response.status().is_success());

        // a second session is refused while the first runs
        let response = client
            .post(server.url("/api/record"))
            .json(&serde_json::json!({ "motion": "YES" }))
            .send()
            .await
            .expect("Failed to send request");
        assert_eq!(response.status(), reqwest::StatusCode::CONFLICT);

        let status = next_status(&client, &server).await;
        assert_eq!(status["status"], "prediction");
        assert_eq!(status["prediction"], "MOVE");

        let body: serde_json::Value = client
            .get(server.url("/api/prediction"))
            .send()
            .await
            .expect("Failed to send request")
            .json()
            .await
            .expect("Failed to parse JSON");
        assert_eq!(body["prediction"], "MOVE");

        let response = client
            .post(server.url("/api/stop-inference"))
            .send()
            .await
            .expect("Failed to send request");
        assert!(response.status().is_success());

        server.stop();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cors_headers() {
        let server = start(|_| {}).await;

        // Send OPTIONS request to check CORS
        let client = reqwest::Client::new();
        let response = client
            .request(reqwest::Method::OPTIONS, server.url("/api/status"))
            .header("Origin", "http://localhost:3000")
            .header("Access-Control-Request-Method", "GET")
            .send()
            .await
            .expect("Failed to send request");

        // CORS preflight should succeed
        assert!(
            response.status().is_success() || response.status() == reqwest::StatusCode::NO_CONTENT,
            "CORS preflight failed: {}",
            response.status()
        );
        assert_eq!(
            response
                .headers()
                .get("access-control-allow-origin")
                .and_then(|v| v.to_str().ok()),
            Some("http://localhost:3000")
        );

        server.stop();
    }
}
