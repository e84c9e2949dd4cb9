use std::io::IsTerminal;
use std::process::ExitCode;

use clap::Parser;

use bluno::{Args, OutputFormat, driver_for, run_with_log_level};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let mut stdout = std::io::stdout();

    let run_result = async {
        let log_level = args.log_level();
        let output_format = args.output_format().unwrap_or(if stdout.is_terminal() {
            OutputFormat::Pretty
        } else {
            OutputFormat::Json
        });
        let (command, options, maybe_fake_args) = args.into_parts()?;
        let driver = driver_for(maybe_fake_args).await?;

        run_with_log_level(
            command,
            options,
            &mut stdout,
            driver,
            output_format,
            log_level,
        )
        .await
    }
    .await;

    match run_result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::from(1)
        }
    }
}
