//! Unit tests for the command tree, option parsing, and in-process
//! execution.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use cmdpipe::command::{self, ArgSpec, Command, Environment, OptionKind, OptionSpec};
use cmdpipe::demo;
use cmdpipe::encoding::Payload;
use cmdpipe::errors::{CmdError, ErrorCode};
use cmdpipe::request::{OptionValue, Request};
use cmdpipe::stream::{collect, Received};
use cmdpipe::AppError;

fn env() -> Environment {
    Arc::new(())
}

fn raw(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect()
}

fn with_options() -> Command {
    Command::new(|_req: Request, _re, _env| async { Ok::<(), AppError>(()) })
        .option(OptionSpec::new("count", OptionKind::Uint, "How many.").alias("n"))
        .option(OptionSpec::new("verbose", OptionKind::Bool, "Chatty."))
        .option(OptionSpec::new("tag", OptionKind::Strings, "Labels."))
}

// ── Path resolution ──────────────────────────────────────────────────────────

#[test]
fn resolve_finds_nested_commands() {
    let root = demo::root();
    assert!(root.resolve(&["add"]).is_ok());
    assert!(root.resolve(&["version"]).expect("version").is_read_only());
}

#[test]
fn resolve_unknown_command_is_not_found() {
    let err = demo::root().resolve(&["nope"]).expect_err("unknown");
    assert_eq!(err.code(), ErrorCode::NotFound);
}

#[test]
fn resolve_namespace_is_not_runnable() {
    let err = demo::root().resolve::<&str>(&[]).expect_err("root is a namespace");
    assert_eq!(err.code(), ErrorCode::NotFound);
}

#[test]
fn split_path_stops_at_first_argument() {
    let tokens: Vec<String> = ["add", "1", "2"].map(String::from).to_vec();
    let root = demo::root();
    let (path, args) = root.split_path(&tokens);
    assert_eq!(path, ["add"]);
    assert_eq!(args, ["1", "2"]);
}

// ── Options and arguments ────────────────────────────────────────────────────

#[test]
fn options_are_typed_and_keyed_by_canonical_name() {
    let options = with_options()
        .parse_options(
            &raw(&[("n", "3"), ("verbose", ""), ("tag", "a"), ("tag", "b"), ("enc", "text")]),
            BTreeMap::new(),
        )
        .expect("valid options");

    assert_eq!(options.get("count"), Some(&OptionValue::Uint(3)));
    assert_eq!(options.get("verbose"), Some(&OptionValue::Bool(true)));
    assert_eq!(
        options.get("tag"),
        Some(&OptionValue::Strings(vec!["a".into(), "b".into()]))
    );
    assert_eq!(
        options.get("encoding"),
        Some(&OptionValue::String("text".into()))
    );
}

#[test]
fn unknown_option_is_protocol_error() {
    let err = with_options()
        .parse_options(&raw(&[("bogus", "1")]), BTreeMap::new())
        .expect_err("unknown option");
    assert_eq!(err.code(), ErrorCode::Client);
}

#[test]
fn option_type_mismatch_is_rejected() {
    assert!(with_options()
        .parse_options(&raw(&[("count", "-1")]), BTreeMap::new())
        .is_err());
    assert!(with_options()
        .parse_options(&raw(&[("count", "1"), ("count", "2")]), BTreeMap::new())
        .is_err());
}

#[test]
fn typed_options_are_coerced() {
    let mut typed = BTreeMap::new();
    typed.insert("tag".to_owned(), OptionValue::String("solo".into()));
    let options = with_options()
        .parse_options(&[], typed)
        .expect("valid options");
    assert_eq!(
        options.get("tag"),
        Some(&OptionValue::Strings(vec!["solo".into()]))
    );

    let mut typed = BTreeMap::new();
    typed.insert("count".to_owned(), OptionValue::Bool(true));
    assert!(with_options().parse_options(&[], typed).is_err());
}

#[test]
fn argument_arity_is_checked() {
    let cmd = Command::new(|_req: Request, _re, _env| async { Ok::<(), AppError>(()) })
        .argument(ArgSpec::new("first", true, false, "Required."))
        .argument(ArgSpec::new("second", false, false, "Optional."));

    assert!(cmd.check_arguments(&["a".into()]).is_ok());
    assert!(cmd.check_arguments(&["a".into(), "b".into()]).is_ok());
    assert!(cmd.check_arguments(&[]).is_err());
    assert!(cmd
        .check_arguments(&["a".into(), "b".into(), "c".into()])
        .is_err());
}

#[test]
fn variadic_argument_absorbs_the_rest() {
    let add = demo::root();
    let add = add.resolve(&["add"]).expect("add");
    let many: Vec<String> = (0..10).map(|i| i.to_string()).collect();
    assert!(add.check_arguments(&many).is_ok());
    assert!(add.check_arguments(&[]).is_err(), "summands are required");
}

// ── Execution ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn adder_streams_intermediate_results() {
    let root = demo::root();
    let add = root.resolve(&["add"]).expect("add");
    let req = Request::new(["add"]).with_arguments(["3", "2", "3"]);

    let mut res = command::execute(add, req, env()).expect("execute");
    let values = collect(&mut res).await.expect("stream succeeds");

    assert_eq!(
        values,
        vec![
            Payload::text("intermediate result: 3; 2 left"),
            Payload::text("intermediate result: 5; 1 left"),
            Payload::text("total: 8"),
        ]
    );
}

#[tokio::test]
async fn encode_add_declares_length() {
    let root = demo::root();
    let cmd = root.resolve(&["encode-add"]).expect("encode-add");
    let req = Request::new(["encode-add"]).with_arguments(["1", "1"]);

    let mut res = command::execute(cmd, req, env()).expect("execute");
    assert!(matches!(res.next().await, Received::Value(_)));
    assert_eq!(res.length().await, 2);
}

#[tokio::test]
async fn handler_error_closes_stream_with_error() {
    let cmd = Command::new(|_req: Request, re, _env| async move {
        re.emit(Payload::text("partial")).await?;
        Err::<(), AppError>(AppError::command(ErrorCode::Fatal, "late failure"))
    });

    let mut res = command::execute(&cmd, Request::default(), env()).expect("execute");
    assert_eq!(res.next().await, Received::Value(Payload::text("partial")));
    assert_eq!(
        res.next().await,
        Received::Error(AppError::command(ErrorCode::Fatal, "late failure"))
    );
}

#[tokio::test]
async fn handler_closing_its_own_stream_keeps_outcome() {
    let cmd = Command::new(|_req: Request, re, _env| async move {
        re.close_with_error(CmdError::normal("closed early")).await?;
        Ok::<(), AppError>(())
    });

    let mut res = command::execute(&cmd, Request::default(), env()).expect("execute");
    assert_eq!(
        res.next().await,
        Received::Error(AppError::Command(CmdError::normal("closed early")))
    );
}

#[tokio::test]
async fn panicking_handler_reports_implementation_error() {
    let cmd = Command::new(|_req: Request, _re, _env| async move {
        if true {
            panic!("handler bug");
        }
        Ok::<(), AppError>(())
    });

    let mut res = command::execute(&cmd, Request::default(), env()).expect("execute");
    match res.next().await {
        Received::Error(err) => assert_eq!(err.code(), ErrorCode::Implementation),
        other => panic!("expected error, got {other:?}"),
    }
}

#[tokio::test]
async fn timeout_cancels_a_stalled_handler() {
    let cmd = Command::new(|_req: Request, re, _env| async move {
        re.cancellation().cancelled().await;
        Ok::<(), AppError>(())
    });
    let req = Request::default().with_option("timeout", OptionValue::String("50ms".into()));

    let mut res = command::execute(&cmd, req, env()).expect("execute");
    let received = tokio::time::timeout(Duration::from_secs(5), res.next())
        .await
        .expect("deadline must fire");
    assert!(matches!(received, Received::Error(ref err) if err.is_cancelled()));
}

#[tokio::test]
async fn deadline_timer_stops_once_handler_finishes() {
    let cmd = Command::new(|_req: Request, re, _env| async move {
        re.emit(Payload::text("quick")).await
    });
    let req = Request::default().with_option("timeout", OptionValue::String("50ms".into()));
    let cancel = req.cancellation().clone();

    let mut res = command::execute(&cmd, req, env()).expect("execute");
    let values = collect(&mut res).await.expect("stream succeeds");
    assert_eq!(values, vec![Payload::text("quick")]);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!cancel.is_cancelled(), "finished invocation must not be cancelled later");
}

#[tokio::test]
async fn namespace_cannot_be_executed() {
    let err = command::execute(&Command::namespace(), Request::default(), env())
        .expect_err("not runnable");
    assert_eq!(err.code(), ErrorCode::NotFound);
}
