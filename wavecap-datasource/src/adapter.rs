//! Adapter entry point: argument resolution, remote bootstrap, signal
//! handling.
//!
//! Local (pipe) helpers just run the engine; the host drives them through
//! probe/open requests. Remote helpers additionally probe their own source
//! before connecting and announce it to the host, which then opens it
//! through the normal command flow.

use wavecap_external::{
    engine::EngineError,
    transport::{
        Endpoint,
        Transport,
        TransportError,
    },
};

use crate::{
    args::{
        ArgsError,
        CommonArgs,
    },
    definition::{
        make_uuid,
        parse_definition,
    },
    source::{
        CaptureSource,
        Datasource,
    },
};

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error(transparent)]
    Args(#[from] ArgsError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("unable to parse source definition {definition:?}")]
    InvalidDefinition { definition: String },

    #[error("source probe failed: {message}")]
    ProbeFailed { message: String },
}

/// Runs `source` as a capture helper with the resolved endpoint.
///
/// With no endpoint arguments, or a remote target without `--source`,
/// this prints a usage note and returns successfully; the helper is meant
/// to be launched by a host, not by hand. `driver` names the adapter in
/// the usage note and in the remote source announcement.
pub async fn run_adapter<S>(
    driver: &str,
    args: &CommonArgs,
    mut source: S,
) -> Result<(), AdapterError>
where
    S: CaptureSource + Send + 'static,
{
    let Some(endpoint) = args.resolve()?
    else {
        print_usage(driver);
        return Ok(());
    };

    // for remote capture the helper must know its source up front; local
    // helpers are probed by the host instead
    let announce = if matches!(endpoint, Endpoint::Pipe { .. }) {
        None
    }
    else {
        let Some(definition) = args.source.as_ref()
        else {
            print_usage(driver);
            return Ok(());
        };
        let (name, options) = parse_definition(definition).ok_or_else(|| {
            AdapterError::InvalidDefinition {
                definition: definition.clone(),
            }
        })?;

        let probe = source
            .probe_source(&name, &options)
            .map_err(|error| {
                AdapterError::ProbeFailed {
                    message: error.to_string(),
                }
            })?
            .ok_or_else(|| {
                AdapterError::ProbeFailed {
                    message: format!("source {name:?} is not handled by this helper"),
                }
            })?;

        let uuid = probe
            .uuid
            .unwrap_or_else(|| make_uuid(driver, &name));
        Some((definition.clone(), uuid))
    };

    let transport = Transport::connect(&endpoint).await?;
    let datasource = Datasource::new(transport, source);
    let handle = datasource.handle();

    if let Some((definition, uuid)) = announce {
        tracing::info!(%definition, %uuid, "announcing remote source");
        handle.send_newsource(&definition, driver, &uuid);
    }

    let signal_handle = handle.clone();
    handle.add_task(tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted, shutting down");
            signal_handle.kill();
        }
    }));

    datasource.run().await?;
    Ok(())
}

fn print_usage(driver: &str) {
    println!("{driver}: capture helper, normally launched by its host");
    println!();
    println!("usage (local):  {driver} --in-fd <fd> --out-fd <fd>");
    println!("usage (remote): {driver} --connect <host:port> --source <definition>");
    println!("                [--tcp] [--ssl [--ssl-certificate <file>]]");
    println!("                [--user <user> --password <password> | --apikey <key>]");
    println!("                [--endpoint <path>]");
}
