//! End-to-end streaming over HTTP: values, early and late failures,
//! trailers, encodings, and client-disconnect cancellation.

use std::time::Duration;

use cmdpipe::encoding::Payload;
use cmdpipe::errors::{CmdError, ErrorCode};
use cmdpipe::http::{ErrorBody, CHUNKED_OUTPUT, CONTENT_LENGTH_HINT, VALUE_FRAMING};
use cmdpipe::request::{Encoding, FilePart, Request};
use cmdpipe::stream::{collect, Consumer, Received};
use cmdpipe::AppError;

use super::test_helpers::{spawn_default, BULK_BYTES, READER_TEXT};

fn raw_text(values: &[Payload]) -> String {
    values
        .iter()
        .map(|value| match value {
            Payload::Raw(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            other => panic!("expected raw text chunk, got {other:?}"),
        })
        .collect()
}

// ── Successful streams ───────────────────────────────────────────────────────

#[tokio::test]
async fn adder_values_match_in_process_run() {
    let server = spawn_default().await;
    let req = Request::new(["add"]).with_arguments(["3", "2", "3"]);

    let mut res = server.client().execute(&req).await.expect("execute");
    assert_eq!(res.encoding(), Encoding::Json);
    let values = collect(&mut res).await.expect("stream succeeds");

    assert_eq!(
        values,
        vec![
            Payload::text("intermediate result: 3; 2 left"),
            Payload::text("intermediate result: 5; 1 left"),
            Payload::text("total: 8"),
        ]
    );
    assert_eq!(res.error(), None);
}

#[tokio::test]
async fn typed_values_use_command_text_encoder() {
    let server = spawn_default().await;
    let req = Request::new(["encode-add"])
        .with_arguments(["1", "2"])
        .with_encoding(Encoding::Text);

    let mut res = server.client().execute(&req).await.expect("execute");
    assert_eq!(res.encoding(), Encoding::Text);
    assert_eq!(Consumer::length(&res).await, 2);
    let values = collect(&mut res).await.expect("stream succeeds");

    assert_eq!(
        raw_text(&values),
        "intermediate result: 1; 1 left\ntotal: 3\n"
    );
}

#[tokio::test]
async fn typed_values_decode_from_json() {
    let server = spawn_default().await;
    let req = Request::new(["encode-add"]).with_arguments(["4"]);

    let mut res = server.client().execute(&req).await.expect("execute");
    let values = collect(&mut res).await.expect("stream succeeds");
    let status: cmdpipe::demo::AddStatus = values[0].decode().expect("decode");
    assert_eq!(status.current, 4);
    assert_eq!(status.left, 0);
}

#[tokio::test]
async fn xml_encoding_is_negotiated() {
    let server = spawn_default().await;
    let req = Request::new(["encode-add"])
        .with_arguments(["4"])
        .with_encoding(Encoding::Xml);

    let mut res = server.client().execute(&req).await.expect("execute");
    assert_eq!(res.encoding(), Encoding::Xml);
    let text = raw_text(&collect(&mut res).await.expect("stream succeeds"));
    assert!(text.starts_with("<Output>"), "unexpected xml: {text}");
    assert!(text.contains("<Current>4</Current>"), "unexpected xml: {text}");
}

#[tokio::test]
async fn single_value_stream() {
    let server = spawn_default().await;
    let mut res = server
        .client()
        .execute(&Request::new(["single"]))
        .await
        .expect("execute");

    assert_eq!(res.next().await, Received::Value(Payload::text("only")));
    assert_eq!(res.next().await, Received::EndOfStream);
}

#[tokio::test]
async fn raw_bytes_carry_declared_length() {
    let server = spawn_default().await;
    let req = Request::new(["reader"]).with_encoding(Encoding::Text);

    let mut res = server.client().execute(&req).await.expect("execute");
    assert_eq!(res.length(), READER_TEXT.len() as u64);
    assert_eq!(
        raw_text(&collect(&mut res).await.expect("stream succeeds")),
        READER_TEXT
    );
}

#[tokio::test]
async fn raw_bytes_default_to_json_string() {
    let server = spawn_default().await;
    let mut res = server
        .client()
        .execute(&Request::new(["reader"]))
        .await
        .expect("execute");

    assert_eq!(res.encoding(), Encoding::Json);
    assert_eq!(
        collect(&mut res).await.expect("stream succeeds"),
        vec![Payload::text(READER_TEXT)]
    );
}

#[tokio::test]
async fn large_text_value_arrives_whole() {
    let server = spawn_default().await;
    let req = Request::new(["bulk"]).with_encoding(Encoding::Text);

    let mut res = server.client().execute(&req).await.expect("execute");
    match res.next().await {
        Received::Value(Payload::Raw(bytes)) => {
            assert_eq!(bytes.len(), BULK_BYTES);
            assert!(bytes.iter().all(|b| *b == b'x'));
        }
        other => panic!("expected one raw value, got {other:?}"),
    }
    assert_eq!(res.next().await, Received::EndOfStream);
}

#[tokio::test]
async fn unframed_text_stays_plain_for_other_clients() {
    let server = spawn_default().await;
    let resp = reqwest::Client::new()
        .post(server.url("/api/v0/reader?encoding=text"))
        .send()
        .await
        .expect("send");

    assert!(resp.headers().get(VALUE_FRAMING).is_none());
    assert_eq!(resp.text().await.expect("body"), READER_TEXT);
}

#[tokio::test]
async fn double_close_still_ends_successfully() {
    let server = spawn_default().await;
    let mut res = server
        .client()
        .execute(&Request::new(["doubleclose"]))
        .await
        .expect("execute");

    let values = collect(&mut res).await.expect("stream succeeds");
    assert_eq!(values, vec![Payload::text("some value")]);
}

#[tokio::test]
async fn multipart_files_reach_the_handler() {
    let server = spawn_default().await;
    let req = Request::new(["echo"]).with_file(FilePart {
        field: "file".into(),
        file_name: Some("greeting.txt".into()),
        content_type: Some("text/plain".into()),
        data: bytes::Bytes::from_static(b"hi there"),
    });

    let mut res = server.client().execute(&req).await.expect("execute");
    assert_eq!(
        collect(&mut res).await.expect("stream succeeds"),
        vec![Payload::text("hi there")]
    );
}

// ── Failures ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn early_error_becomes_status_and_body() {
    let server = spawn_default().await;

    let err = server
        .client()
        .execute(&Request::new(["error"]))
        .await
        .expect_err("early failure");
    assert_eq!(
        err,
        AppError::Command(CmdError::new(ErrorCode::Client, "an error occurred"))
    );

    let resp = reqwest::Client::new()
        .post(server.url("/api/v0/error"))
        .send()
        .await
        .expect("send");
    assert_eq!(resp.status(), 400);
    let body: ErrorBody = resp.json().await.expect("error body");
    assert_eq!(body.message, "an error occurred");
    assert_eq!(body.code, ErrorCode::Client);
    assert_eq!(body.kind, "error");
}

#[tokio::test]
async fn structured_early_error_maps_status() {
    let server = spawn_default().await;
    let resp = reqwest::Client::new()
        .post(server.url("/api/v0/structured"))
        .send()
        .await
        .expect("send");
    assert_eq!(resp.status(), 429);
}

#[tokio::test]
async fn late_error_is_rebuilt_from_trailers() {
    let server = spawn_default().await;
    let mut res = server
        .client()
        .execute(&Request::new(["lateerror"]))
        .await
        .expect("execute");

    assert_eq!(res.next().await, Received::Value(Payload::text("some value")));
    assert_eq!(
        res.next().await,
        Received::Error(AppError::Command(CmdError::new(
            ErrorCode::Fatal,
            "an error occurred"
        )))
    );
    assert_eq!(
        res.error(),
        Some(CmdError::new(ErrorCode::Fatal, "an error occurred"))
    );
}

#[tokio::test]
async fn streamed_response_headers() {
    let server = spawn_default().await;
    let resp = reqwest::Client::new()
        .post(server.url("/api/v0/reader?encoding=text"))
        .header("te", "trailers")
        .send()
        .await
        .expect("send");

    assert_eq!(resp.status(), 200);
    let headers = resp.headers();
    assert_eq!(headers.get(CHUNKED_OUTPUT).expect("chunked marker"), "1");
    assert_eq!(
        headers.get(CONTENT_LENGTH_HINT).expect("length hint"),
        READER_TEXT.len().to_string().as_str()
    );
    assert!(headers
        .get("content-type")
        .expect("content type")
        .to_str()
        .expect("ascii")
        .starts_with("text/plain"));
}

#[tokio::test]
async fn mid_stream_encode_failure_ends_with_error() {
    let server = spawn_default().await;
    let req = Request::new(["lateencode"]).with_encoding(Encoding::Text);

    let mut res = server.client().execute(&req).await.expect("execute");
    let mut text = String::new();
    let terminal = loop {
        match res.next().await {
            Received::Value(Payload::Raw(bytes)) => text.push_str(&String::from_utf8_lossy(&bytes)),
            Received::Value(other) => panic!("unexpected value {other:?}"),
            end => break end,
        }
    };

    assert_eq!(text, "fine\n");
    assert_eq!(
        terminal,
        Received::Error(AppError::Command(CmdError::normal("encode: refusing value")))
    );
}

#[tokio::test]
async fn first_value_cast_failure_is_an_early_error() {
    let server = spawn_default().await;
    let req = Request::new(["miscast"]).with_encoding(Encoding::Text);

    let err = server
        .client()
        .execute(&req)
        .await
        .expect_err("early failure");
    match err {
        AppError::Command(err) => {
            assert_eq!(err.code, ErrorCode::Implementation);
            assert!(err.message.starts_with("cast error:"), "got {}", err.message);
        }
        other => panic!("expected structured error, got {other:?}"),
    }

    let resp = reqwest::Client::new()
        .post(server.url("/api/v0/miscast?encoding=text"))
        .send()
        .await
        .expect("send");
    assert_eq!(resp.status(), 500);
    let body: ErrorBody = resp.json().await.expect("error body");
    assert_eq!(body.code, ErrorCode::Implementation);
}

#[tokio::test]
async fn late_cast_failure_keeps_its_code() {
    let server = spawn_default().await;
    let req = Request::new(["latecast"]).with_encoding(Encoding::Text);

    let mut res = server.client().execute(&req).await.expect("execute");
    assert_eq!(
        res.next().await,
        Received::Value(Payload::Raw(bytes::Bytes::from_static(
            b"intermediate result: 1; 1 left\n"
        )))
    );
    match res.next().await {
        Received::Error(err) => assert_eq!(err.code(), ErrorCode::Implementation),
        other => panic!("expected error, got {other:?}"),
    }
}

// ── Cancellation ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn dropping_the_client_response_cancels_the_handler() {
    let server = spawn_default().await;
    let mut res = server
        .client()
        .execute(&Request::new(["forever"]))
        .await
        .expect("execute");

    assert!(matches!(res.next().await, Received::Value(_)));
    drop(res);

    tokio::time::timeout(Duration::from_secs(5), server.probe.cancelled.notified())
        .await
        .expect("handler must observe cancellation");
}

#[tokio::test]
async fn client_cancellation_stops_reading() {
    let server = spawn_default().await;
    let cancel = tokio_util::sync::CancellationToken::new();
    let req = Request::new(["forever"]).with_cancellation(cancel.clone());

    let mut res = server.client().execute(&req).await.expect("execute");
    assert!(matches!(res.next().await, Received::Value(_)));
    cancel.cancel();

    let terminal = loop {
        match res.next().await {
            Received::Value(_) => {}
            end => break end,
        }
    };
    assert!(matches!(terminal, Received::Error(ref err) if err.is_cancelled()));
}
