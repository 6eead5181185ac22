//! Unit tests for the in-process stream core: hand-off ordering, close
//! semantics, declared length, and cancellation.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use cmdpipe::errors::{CmdError, ErrorCode};
use cmdpipe::stream::{self, collect, Consumer, Received};
use cmdpipe::AppError;

// ── Ordering and termination ─────────────────────────────────────────────────

#[tokio::test]
async fn values_arrive_in_emission_order_then_end() {
    let (re, mut res) = stream::channel::<u32>(CancellationToken::new());

    let producer = tokio::spawn(async move {
        for i in 0..5 {
            re.emit(i).await.expect("emit");
        }
        re.close().await.expect("close");
    });

    let values = collect(&mut res).await.expect("stream succeeds");
    assert_eq!(values, vec![0, 1, 2, 3, 4]);
    producer.await.expect("producer task");

    assert_eq!(res.next().await, Received::EndOfStream);
    assert_eq!(res.next().await, Received::EndOfStream, "end is sticky");
}

#[tokio::test]
async fn late_error_follows_emitted_values() {
    let (re, mut res) = stream::channel::<&'static str>(CancellationToken::new());

    tokio::spawn(async move {
        re.emit("a").await.expect("emit");
        re.close_with_error(CmdError::new(ErrorCode::Fatal, "boom"))
            .await
            .expect("close with error");
    });

    assert_eq!(res.next().await, Received::Value("a"));
    let terminal = res.next().await;
    assert_eq!(
        terminal,
        Received::Error(AppError::command(ErrorCode::Fatal, "boom"))
    );
    assert_eq!(res.error(), Some(CmdError::new(ErrorCode::Fatal, "boom")));
    assert_eq!(res.next().await, terminal, "error is sticky");
}

#[tokio::test]
async fn emit_waits_for_consumer() {
    let (re, mut res) = stream::channel::<u32>(CancellationToken::new());

    let emit = tokio::spawn(async move {
        re.emit(7).await.expect("emit");
        re
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!emit.is_finished(), "emit must block until the value is taken");

    assert_eq!(res.next().await, Received::Value(7));
    let re = emit.await.expect("emit task");
    re.close().await.expect("close");
}

#[tokio::test]
async fn emit_after_close_fails() {
    let (re, mut res) = stream::channel::<u32>(CancellationToken::new());
    re.close().await.expect("close");

    assert_eq!(re.emit(1).await, Err(AppError::ClosedEmitter));
    assert_eq!(res.next().await, Received::EndOfStream);
}

#[tokio::test]
async fn double_close_keeps_first_outcome() {
    let (re, mut res) = stream::channel::<u32>(CancellationToken::new());
    re.close_with_error(CmdError::normal("first")).await.expect("close");

    assert_eq!(re.close().await, Err(AppError::DoubleClose));
    assert_eq!(
        re.close_with_error(CmdError::normal("second")).await,
        Err(AppError::DoubleClose)
    );
    assert_eq!(
        res.next().await,
        Received::Error(AppError::Command(CmdError::normal("first")))
    );
}

#[tokio::test]
async fn dropping_every_emitter_ends_successfully() {
    let (re, mut res) = stream::channel::<u32>(CancellationToken::new());
    let clone = re.clone();
    drop(re);
    drop(clone);

    assert_eq!(res.next().await, Received::EndOfStream);
    assert_eq!(res.error(), None);
}

#[tokio::test]
async fn emit_once_closes_the_stream() {
    let (re, mut res) = stream::channel::<u32>(CancellationToken::new());

    let producer = tokio::spawn(async move {
        re.emit_once(42).await.expect("emit once");
        re
    });

    assert_eq!(res.next().await, Received::Value(42));
    let re = producer.await.expect("producer task");
    assert!(re.is_closed());
    assert_eq!(res.next().await, Received::EndOfStream);
    assert_eq!(re.emit(1).await, Err(AppError::ClosedEmitter));
    assert_eq!(re.close().await, Err(AppError::DoubleClose));
}

// ── Declared length ──────────────────────────────────────────────────────────

#[tokio::test]
async fn length_is_frozen_at_first_emit() {
    let (re, mut res) = stream::channel::<u32>(CancellationToken::new());

    let producer = tokio::spawn(async move {
        re.set_length(3).await;
        re.emit(1).await.expect("emit");
        re.set_length(99).await;
        re.close().await.expect("close");
    });

    assert_eq!(res.next().await, Received::Value(1));
    assert_eq!(res.length().await, 3);
    producer.await.expect("producer task");
    assert_eq!(Consumer::length(&res).await, 3);
}

#[tokio::test]
async fn set_length_racing_first_emit_is_observed() {
    let (re, mut res) = stream::channel::<u32>(CancellationToken::new());
    let other = re.clone();

    let producer = tokio::spawn(async move {
        // set_length acquires the producer lock first; emit queues behind it.
        tokio::join!(other.set_length(4), async {
            tokio::task::yield_now().await;
            re.emit(1).await.expect("emit");
        });
    });

    assert_eq!(res.next().await, Received::Value(1));
    assert_eq!(res.length().await, 4);
    producer.await.expect("producer task");
}

#[tokio::test]
async fn length_defaults_to_zero_on_close() {
    let (re, res) = stream::channel::<u32>(CancellationToken::new());
    re.close().await.expect("close");
    assert_eq!(res.length().await, 0);
}

// ── Cancellation ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn cancellation_unblocks_consumer() {
    let ct = CancellationToken::new();
    let (_re, mut res) = stream::channel::<u32>(ct.clone());

    let waiter = tokio::spawn(async move { res.next().await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    ct.cancel();

    let received = waiter.await.expect("waiter task");
    assert!(matches!(received, Received::Error(ref err) if err.is_cancelled()));
}

#[tokio::test]
async fn cancellation_unblocks_producer_without_delivery() {
    let ct = CancellationToken::new();
    let (re, _res) = stream::channel::<u32>(ct.clone());

    let producer = tokio::spawn(async move { re.emit(1).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    ct.cancel();

    let result = producer.await.expect("producer task");
    assert!(matches!(result, Err(ref err) if err.is_cancelled()));
}

#[tokio::test]
async fn dropped_consumer_fails_emit() {
    let (re, res) = stream::channel::<u32>(CancellationToken::new());
    drop(res);
    assert!(re.emit(1).await.expect_err("emit must fail").is_cancelled());
}

// ── Stream adapters ──────────────────────────────────────────────────────────

#[tokio::test]
async fn emit_chan_forwards_every_value() {
    let (re, mut res) = stream::channel::<u32>(CancellationToken::new());
    let (tx, rx) = mpsc::channel(4);

    tokio::spawn(async move {
        for i in 1..=3 {
            tx.send(i).await.expect("send");
        }
    });
    tokio::spawn(async move {
        re.emit_chan(rx).await.expect("emit chan");
        re.close().await.expect("close");
    });

    assert_eq!(collect(&mut res).await.expect("collect"), vec![1, 2, 3]);
}

#[tokio::test]
async fn emit_stream_forwards_every_value() {
    let (re, mut res) = stream::channel::<u32>(CancellationToken::new());

    tokio::spawn(async move {
        re.emit_stream(futures_util::stream::iter(vec![4, 5]))
            .await
            .expect("emit stream");
    });

    assert_eq!(collect(&mut res).await.expect("collect"), vec![4, 5]);
}

#[tokio::test]
async fn absent_consumer_is_empty_success() {
    let mut absent: Option<stream::Response<u32>> = None;
    assert_eq!(Consumer::next(&mut absent).await, Received::EndOfStream);
    assert_eq!(Consumer::length(&absent).await, 0);
    assert_eq!(Consumer::error(&absent), None);
}
