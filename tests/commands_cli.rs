use clap::Parser;
use pretty_assertions::assert_eq;
use serde_json::Value;

#[derive(Debug, Default)]
struct FakeTerminalClient;

impl bluno::TerminalClient for FakeTerminalClient {
    fn stdout_is_terminal(&self) -> bool {
        false
    }

    fn stderr_is_terminal(&self) -> bool {
        false
    }
}

async fn run_with_parsed_args(args: bluno::Args, format: bluno::OutputFormat) -> anyhow::Result<String> {
    let mut output = Vec::new();
    let (command, options, maybe_fake_args) = args.into_parts()?;
    let driver = bluno::driver_for(maybe_fake_args).await?;
    bluno::run_with_clients(
        command,
        options,
        &mut output,
        &FakeTerminalClient,
        driver,
        format,
        None,
    )
    .await?;
    Ok(String::from_utf8(output)?)
}

fn fake_bluno() -> bluno::FakeArgs {
    bluno::FakeArgs::builder().build()
}

#[tokio::test]
async fn inspect_prints_catalog_and_roles() -> anyhow::Result<()> {
    let args = bluno::Args::new(bluno::Command::Inspect).with_fake(fake_bluno());

    let stdout = run_with_parsed_args(args, bluno::OutputFormat::Pretty).await?;

    assert!(stdout.starts_with("Connected device:"));
    assert!(stdout.contains("Bluno roles:"));
    assert!(stdout.contains("Device Information"));
    assert!(stdout.contains("Bluno serial service"));
    assert!(stdout.contains("Model number"));
    Ok(())
}

#[tokio::test]
async fn inspect_json_reports_compatibility() -> anyhow::Result<()> {
    let args = bluno::Args::new(bluno::Command::Inspect)
        .with_address("AA:BB:CC:DD:EE:FF")
        .with_fake(fake_bluno());

    let stdout = run_with_parsed_args(args, bluno::OutputFormat::Json).await?;
    let report: Value = serde_json::from_str(&stdout)?;

    assert_eq!(Value::Bool(true), report["compatible"]);
    assert_eq!("AA:BB:CC:DD:EE:FF", report["address"]);
    assert_eq!(Some(2), report["services"].as_array().map(Vec::len));
    assert_eq!(Some(0), report["missing_roles"].as_array().map(Vec::len));
    Ok(())
}

#[tokio::test]
async fn inspect_still_reports_devices_missing_bluno_roles() -> anyhow::Result<()> {
    let fake = bluno::FakeArgs::builder()
        .services("0000180a-0000-1000-8000-00805f9b34fb=00002a24-0000-1000-8000-00805f9b34fb:read")?
        .build();
    let args = bluno::Args::new(bluno::Command::Inspect).with_fake(fake);

    let stdout = run_with_parsed_args(args, bluno::OutputFormat::Json).await?;
    let report: Value = serde_json::from_str(&stdout)?;

    assert_eq!(Value::Bool(false), report["compatible"]);
    assert_eq!(
        serde_json::json!(["serial", "command"]),
        report["missing_roles"]
    );
    Ok(())
}

#[tokio::test]
async fn listen_streams_notices_until_the_limit() -> anyhow::Result<()> {
    let args = bluno::Args::new(bluno::Command::Listen(bluno::ListenArgs::new(Some(3))))
        .with_fake(fake_bluno());

    let stdout = run_with_parsed_args(args, bluno::OutputFormat::Json).await?;
    let lines: Vec<Value> = stdout
        .lines()
        .map(serde_json::from_str)
        .collect::<Result<_, _>>()?;

    assert_eq!(4, lines.len());
    assert_eq!("connected", lines[0]["notice"]);
    assert_eq!("services_ready", lines[1]["notice"]);
    assert_eq!(
        serde_json::json!({"reason": "reached_limit", "limit": 3}),
        lines[3]["stop_reason"]
    );
    assert_eq!(3, lines[3]["received"]);
    Ok(())
}

#[tokio::test]
async fn listen_pretty_output_ends_with_a_summary() -> anyhow::Result<()> {
    let fake = bluno::FakeArgs::builder()
        .notifications("4F4B0D0A")?
        .build();
    let args = bluno::Args::new(bluno::Command::Listen(bluno::ListenArgs::new(Some(2)))).with_fake(fake);

    let stdout = run_with_parsed_args(args, bluno::OutputFormat::Pretty).await?;

    assert!(stdout.starts_with("Listening:"));
    assert!(stdout.contains("[0001] connected"));
    assert!(stdout.contains("[0002] services_ready"));
    assert!(
        stdout
            .trim_end()
            .ends_with("Stopped: reached limit of 2 notice(s) - received 2 notice(s), handshake incomplete")
    );
    Ok(())
}

#[tokio::test]
async fn send_writes_after_the_handshake() -> anyhow::Result<()> {
    let args = bluno::Args::new(bluno::Command::Send(bluno::SendArgs::new("hello")))
        .with_fake(fake_bluno());

    let stdout = run_with_parsed_args(args, bluno::OutputFormat::Pretty).await?;

    assert!(stdout.starts_with("Sent:"));
    assert!(stdout.contains("Bluno serial port"));
    assert!(stdout.contains("hello"));
    assert!(stdout.contains("acknowledged"));
    Ok(())
}

#[tokio::test]
async fn command_json_names_the_command_channel() -> anyhow::Result<()> {
    let args = bluno::Args::try_parse_from(["bluno", "--fake", "--output", "json", "command", "AT+VERSION=?"])?;
    let format = args.output_format().unwrap_or(bluno::OutputFormat::Pretty);

    let stdout = run_with_parsed_args(args, format).await?;
    let report: Value = serde_json::from_str(&stdout)?;

    assert_eq!("command", report["channel"]);
    assert_eq!("AT+VERSION=?", report["text"]);
    Ok(())
}

#[tokio::test]
async fn send_to_a_device_without_bluno_roles_fails() {
    let fake = bluno::FakeArgs::builder()
        .services("0000180a-0000-1000-8000-00805f9b34fb=00002a24-0000-1000-8000-00805f9b34fb:read")
        .expect("fixture should parse")
        .build();
    let args = bluno::Args::new(bluno::Command::Send(bluno::SendArgs::new("hello"))).with_fake(fake);

    let error = run_with_parsed_args(args, bluno::OutputFormat::Pretty)
        .await
        .expect_err("incompatible devices should be rejected");

    assert!(
        error
            .to_string()
            .starts_with("the connected peripheral is not a supported Bluno device")
    );
}

#[test]
fn invalid_fixture_is_rejected_by_the_builder() {
    let result = bluno::FakeArgs::builder().services("no-separator");

    assert!(matches!(result, Err(bluno::FixtureError::InvalidServiceRecord)));
}

#[test]
fn invalid_notification_hex_is_rejected() {
    let result = bluno::FakeArgs::builder().notifications("ABC");

    assert!(matches!(result, Err(bluno::FixtureError::InvalidHexLength)));
}
