mod authorize;
mod broker;
mod controller;
mod engine;
mod event;
mod grouping;
mod logging;

use anyhow::Context;
use common::config::Config;
use event::command;
use event::{Command, EventReceiver};
use log::{error, info};
use rest::{AuthError, SchwabRestApi, Session};
use rustyline::history::FileHistory;
use rustyline::Editor;
use std::env;
use std::panic::{self, AssertUnwindSafe};
use tokio::{runtime::Builder, task};

fn main() {
    if let Err(error) = setup_and_launch() {
        println!("{error:?}");
    }
}

fn setup_and_launch() -> Result<(), anyhow::Error> {
    let (editor, logger_printer) = Editor::<(), FileHistory>::new()
        .and_then(|mut editor| {
            let printer = editor.create_external_printer()?;
            Ok((editor, printer))
        })
        .context("Failed to setup CLI")?;

    Config::init().context("Failed to initialize config")?;

    logging::init_logger(logger_printer).context("Failed to initialize logger")?;

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let rt = Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()
            .context("Failed to launch runtime")?;

        let result = rt.block_on(launch(editor));
        // The terminal reader may still be blocked on a read
        rt.shutdown_background();
        result
    }));

    match result {
        Ok(Ok(())) => (),
        Ok(Err(error)) => error!("Caught error: {error:?}"),
        Err(panic) => {
            let message = panic
                .downcast_ref::<String>()
                .map(|string| &**string)
                .or_else(|| panic.downcast_ref::<&'static str>().copied());

            match message {
                Some(message) => error!("Caught panic: {message}"),
                None => error!("Caught panic; unable to extract associated message"),
            }
        }
    }

    logging::cleanup();
    Ok(())
}

async fn launch(editor: Editor<(), FileHistory>) -> anyhow::Result<()> {
    let (editor, session) = open_session(editor).await?;

    let rest_api = SchwabRestApi::new(session)
        .await
        .context("Failed to setup REST API")?;

    let events = EventReceiver::new();
    task::spawn(command::run_task(events.new_emitter::<Command>(), editor));

    engine::run(events, rest_api).await
}

/// Loads the stored session, or walks through a browser login when there is none yet or
/// when started as `schwab-cli authorize`.
async fn open_session(
    editor: Editor<(), FileHistory>,
) -> anyhow::Result<(Editor<(), FileHistory>, Session)> {
    if env::args().nth(1).as_deref() == Some("authorize") {
        return authorize::run(editor).await;
    }

    match Session::load(&Config::get().auth_file) {
        Ok(session) => Ok((editor, session)),
        Err(AuthError::MissingTokenStore(path)) => {
            info!("No token store at {}, authorizing a new session", path.display());
            authorize::run(editor).await
        }
        Err(error) => Err(error).context("Failed to load the stored session"),
    }
}
