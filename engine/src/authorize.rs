//! Creates the token store from a browser login: the user opens the authorize URL, logs
//! in, and pastes back the URL the browser was redirected to.

use anyhow::{bail, Context};
use common::config::Config;
use log::{info, warn};
use rest::{authorization_code, authorize_url, Session};
use rustyline::error::ReadlineError;
use rustyline::history::FileHistory;
use rustyline::Editor;
use tokio::task;

pub async fn run(
    mut editor: Editor<(), FileHistory>,
) -> anyhow::Result<(Editor<(), FileHistory>, Session)> {
    let config = Config::get();
    let url = authorize_url(
        &config.urls.oauth_api_root,
        &config.keys.app_key,
        &config.keys.callback_url,
    )?;

    info!("Open this URL in a browser, log in and accept all prompts:\n{url}");
    info!("Then paste the URL the browser lands on. Its code expires after about 30 seconds.");

    loop {
        let (returned, input) = task::spawn_blocking(move || {
            let result = editor.readline("Redirected URL: ");
            (editor, result)
        })
        .await
        .context("Terminal reader task panicked")?;
        editor = returned;

        let input = match input {
            Ok(input) => input,
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => {
                bail!("Authorization cancelled")
            }
            Err(error) => return Err(error).context("Failed to read the redirected URL"),
        };

        let Some(code) = authorization_code(&input) else {
            warn!("That URL has no code parameter; paste the full address from the browser");
            continue;
        };

        let session = rest::authorize_session(&code).await?;
        return Ok((editor, session));
    }
}
