//! 上传服务 HTTP 客户端集成测试
//!
//! 用 wiremock 模拟 start / upload / 预签名 PUT / commit / complete 接口

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use cloud_upload_rust::api::{
        ApiError, CommitRequest, CompleteRequest, PartRequest, StartOutcome, StartRequest,
        StoreOptions, UploadApi, UploadSession, BODY_FRAME_SIZE,
    };
    use cloud_upload_rust::config::ApiConfig;
    use cloud_upload_rust::{BytesSource, UploadClient, UploadCoordinator, UploadOptions, UploadStatus};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> UploadClient {
        UploadClient::new(&ApiConfig {
            base_url: server.uri(),
            api_key: "test-key".to_string(),
            timeout_secs: 5,
            ..Default::default()
        })
        .unwrap()
    }

    fn session(intelligent: bool) -> UploadSession {
        UploadSession {
            uri: "/bucket/key".to_string(),
            region: "us-east-1".to_string(),
            upload_id: "upload-1".to_string(),
            location_url: None,
            intelligent,
        }
    }

    fn start_request() -> StartRequest {
        StartRequest {
            filename: "report.bin".to_string(),
            mime_type: "application/octet-stream".to_string(),
            size: 11,
            store: StoreOptions::default(),
            security: None,
            intelligent: true,
        }
    }

    fn complete_request(parts: Option<Vec<(usize, String)>>) -> CompleteRequest {
        CompleteRequest {
            filename: "report.bin".to_string(),
            mime_type: "application/octet-stream".to_string(),
            size: 11,
            store: StoreOptions::default(),
            security: None,
            parts,
        }
    }

    /// upload 接口返回指向同一 mock 服务器的预签名地址
    async fn mount_signed_upload(server: &MockServer, etag: &str) {
        Mock::given(method("POST"))
            .and(path("/multipart/upload"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "url": format!("{}/signed/object", server.uri()),
                "headers": { "x-amz-meta-test": "1" }
            })))
            .mount(server)
            .await;

        Mock::given(method("PUT"))
            .and(path("/signed/object"))
            .and(header("x-amz-meta-test", "1"))
            .respond_with(ResponseTemplate::new(200).insert_header("ETag", etag))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_start_returns_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/multipart/start"))
            .and(body_string_contains("apikey=test-key"))
            .and(body_string_contains("filename=report.bin"))
            .and(body_string_contains("multipart=true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "uri": "/bucket/key",
                "region": "us-east-1",
                "upload_id": "upload-1",
                "upload_type": "intelligent_ingestion"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let response = client_for(&server).start(&start_request()).await.unwrap();
        match response.into_session() {
            StartOutcome::Session(session) => {
                assert_eq!(session.upload_id, "upload-1");
                assert!(session.intelligent);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_start_error_field_is_returned_for_validation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/multipart/start"))
            .respond_with(
                ResponseTemplate::new(403).set_body_json(json!({ "error": "Invalid API key" })),
            )
            .mount(&server)
            .await;

        let response = client_for(&server).start(&start_request()).await.unwrap();
        assert_eq!(
            response.into_session(),
            StartOutcome::Rejected("Invalid API key".to_string())
        );
    }

    #[tokio::test]
    async fn test_start_server_error_without_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/multipart/start"))
            .respond_with(ResponseTemplate::new(500).set_body_string("oops"))
            .mount(&server)
            .await;

        let error = client_for(&server).start(&start_request()).await.unwrap_err();
        assert_eq!(
            error,
            ApiError::Status {
                status: 500,
                body: "oops".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_upload_part_returns_etag() {
        let server = MockServer::start().await;
        mount_signed_upload(&server, "\"etag-1\"").await;

        let ack = client_for(&server)
            .upload_part(
                &session(false),
                PartRequest {
                    part: 1,
                    offset: None,
                    data: Bytes::from_static(b"hello"),
                    store: StoreOptions::default(),
                    security: None,
                    on_sent: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(ack.etag.as_deref(), Some("\"etag-1\""));
    }

    #[tokio::test]
    async fn test_upload_part_sends_md5_and_offset() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/multipart/upload"))
            .and(body_string_contains("part=2"))
            .and(body_string_contains("offset=1024"))
            .and(body_string_contains("size=5"))
            // md5("hello") 的 base64 经过表单编码
            .and(body_string_contains("md5=XUFAKrxLKna5cZ2REBfFkg%3D%3D"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "url": format!("{}/signed/object", server.uri()),
                "headers": {}
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/signed/object"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let ack = client_for(&server)
            .upload_part(
                &session(true),
                PartRequest {
                    part: 2,
                    offset: Some(1024),
                    data: Bytes::from_static(b"hello"),
                    store: StoreOptions::default(),
                    security: None,
                    on_sent: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(ack.etag, None);
    }

    #[tokio::test]
    async fn test_upload_part_reports_sent_frames() {
        let server = MockServer::start().await;
        mount_signed_upload(&server, "\"etag-2\"").await;

        let sent = Arc::new(Mutex::new(Vec::new()));
        let sink = sent.clone();
        let data = vec![9u8; 2 * BODY_FRAME_SIZE + 100];

        let ack = client_for(&server)
            .upload_part(
                &session(false),
                PartRequest {
                    part: 2,
                    offset: None,
                    data: Bytes::from(data),
                    store: StoreOptions::default(),
                    security: None,
                    on_sent: Some(Arc::new(move |n: u64| sink.lock().push(n))),
                },
            )
            .await
            .unwrap();

        assert_eq!(ack.etag.as_deref(), Some("\"etag-2\""));
        let frame = BODY_FRAME_SIZE as u64;
        assert_eq!(*sent.lock(), vec![frame, frame, 100]);

        // 预签名地址收到完整负载
        let requests = server.received_requests().await.unwrap();
        let put = requests
            .iter()
            .find(|r| r.method.as_str() == "PUT")
            .unwrap();
        assert_eq!(put.body.len(), 2 * BODY_FRAME_SIZE + 100);
    }

    #[tokio::test]
    async fn test_commit_part() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/multipart/commit"))
            .and(body_string_contains("part=3"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        client_for(&server)
            .commit_part(
                &session(true),
                &CommitRequest {
                    part: 3,
                    size: 100,
                    store: StoreOptions::default(),
                    security: None,
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_complete_sends_parts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/multipart/complete"))
            // "1:e1;2:e2" 经过表单编码
            .and(body_string_contains("parts=1%3Ae1%3B2%3Ae2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "handle": "h1",
                "url": "https://cdn.example.com/h1",
                "size": 11
            })))
            .expect(1)
            .mount(&server)
            .await;

        let response = client_for(&server)
            .complete(
                &session(false),
                &complete_request(Some(vec![(1, "e1".to_string()), (2, "e2".to_string())])),
            )
            .await
            .unwrap();

        assert_eq!(response.handle.as_deref(), Some("h1"));
        assert_eq!(response.size, Some(11));
    }

    #[tokio::test]
    async fn test_complete_non_200_is_status_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/multipart/complete"))
            .respond_with(ResponseTemplate::new(202).set_body_string("pending"))
            .mount(&server)
            .await;

        let error = client_for(&server)
            .complete(&session(true), &complete_request(None))
            .await
            .unwrap_err();

        assert!(matches!(error, ApiError::Status { status: 202, .. }));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_network_error() {
        let client = UploadClient::new(&ApiConfig {
            base_url: "http://127.0.0.1:1".to_string(),
            timeout_secs: 5,
            ..Default::default()
        })
        .unwrap();

        let error = client.start(&start_request()).await.unwrap_err();
        assert!(error.is_network());
    }

    #[tokio::test]
    async fn test_coordinator_end_to_end() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/multipart/start"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "uri": "/bucket/key",
                "region": "us-east-1",
                "upload_id": "upload-1"
            })))
            .expect(1)
            .mount(&server)
            .await;
        mount_signed_upload(&server, "etag-x").await;
        Mock::given(method("POST"))
            .and(path("/multipart/complete"))
            .and(body_string_contains("parts=1%3Aetag-x%3B2%3Aetag-x%3B3%3Aetag-x"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "handle": "h1" })))
            .expect(1)
            .mount(&server)
            .await;

        let options = UploadOptions {
            chunk_size: 4,
            part_concurrency: 2,
            intelligent: false,
            ..Default::default()
        };
        let source = Arc::new(BytesSource::new("report.bin", b"hello world".to_vec()));
        let coordinator =
            UploadCoordinator::new(Arc::new(client_for(&server)), source, options).unwrap();

        assert!(coordinator.start());
        assert_eq!(coordinator.wait().await, UploadStatus::Completed);
        assert_eq!(coordinator.progress().uploaded_bytes, 11);
    }
}
