use std::{path::Path, sync::Arc};

use anyhow::Context;
use kova_common::{internal, tracing};
use kova_delivery::{ConnectionManager, DispatchOutcome, Mailer};

use crate::{Manifest, Settings};

/// Dispatch a manifest and print its report.
///
/// Returns whether every job succeeded.
pub async fn dispatch(settings: &Settings, manifest: &Path, json: bool) -> anyhow::Result<bool> {
    let manifest = Manifest::load(manifest, settings)?;
    let mailer = Mailer::new(settings.mailer.clone()).context("invalid mailer configuration")?;

    if !mailer.start().await {
        tracing::warn!("No SMTP session at startup, sends will retry on their own");
    }

    // First Ctrl-C lets sends on the wire finish and fails the rest, a second
    // one abandons the batch.
    let dispatch = mailer.dispatch(manifest.jobs, &manifest.context);
    tokio::pin!(dispatch);
    let outcome = tokio::select! {
        outcome = &mut dispatch => outcome,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted, waiting for sends in flight (Ctrl-C again to abort)");
            mailer.interrupt();
            tokio::select! {
                outcome = &mut dispatch => outcome,
                _ = tokio::signal::ctrl_c() => {
                    tracing::warn!("Aborting, closing SMTP sessions");
                    mailer.stop().await;
                    anyhow::bail!("dispatch aborted");
                }
            }
        }
    };

    mailer.stop().await;
    print_outcome(&outcome, json)?;

    let stats = mailer.stats();
    internal!(
        level = INFO,
        "Dispatch finished: {} sent, {} failed",
        stats.sent,
        stats.failed
    );
    Ok(outcome.all_succeeded())
}

fn print_outcome(outcome: &DispatchOutcome, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&outcome.report)?);
    } else {
        println!("{}", outcome.report.text);
    }
    Ok(())
}

/// Validate the configuration and open one authenticated session.
///
/// Returns whether a session could be opened.
pub async fn check(settings: &Settings) -> anyhow::Result<bool> {
    settings
        .mailer
        .validate()
        .context("invalid mailer configuration")?;

    let manager = ConnectionManager::new(Arc::new(settings.mailer.clone()));
    let ports = settings.mailer.effective_ports();

    match manager.open_session().await {
        Ok(session) => {
            println!(
                "Connected to {}:{} as {} ({} policy)",
                settings.mailer.host,
                session.port(),
                settings.mailer.sender(),
                settings.mailer.tls
            );
            session.close(settings.mailer.timeouts.quit()).await;
            Ok(true)
        }
        Err(e) => {
            println!(
                "Could not connect to {} on any of {ports:?}: {e}",
                settings.mailer.host
            );
            Ok(false)
        }
    }
}
