//! Command line surface shared by every capture helper.
//!
//! A helper launched by the host gets an inherited descriptor pair via
//! `--in-fd`/`--out-fd`; remote capture connects to `--connect host:port`
//! with a `--source` definition, over WebSocket by default or raw TCP with
//! `--tcp`. When neither is supplied the helper prints a usage note and
//! exits successfully.

use std::path::PathBuf;

use wavecap_external::transport::{
    Endpoint,
    WsAuth,
};

#[derive(Debug, thiserror::Error)]
pub enum ArgsError {
    #[error("expected host:port for --connect, got {connect:?}")]
    InvalidConnect { connect: String },

    #[error("websocket remote capture requires --user and --password, or --apikey")]
    MissingAuth,
}

/// Arguments every capture helper accepts, flattened into the adapter's
/// own parser.
#[derive(Clone, Debug, clap::Args)]
pub struct CommonArgs {
    /// Incoming descriptor of the IPC pipe pair (IPC mode only).
    #[clap(long = "in-fd")]
    pub in_fd: Option<i32>,

    /// Outgoing descriptor of the IPC pipe pair (IPC mode only).
    #[clap(long = "out-fd")]
    pub out_fd: Option<i32>,

    /// Remote host as host:port; uses websocket mode unless --tcp is given.
    #[clap(long)]
    pub connect: Option<String>,

    /// Capture source definition, required for remote capture.
    #[clap(long)]
    pub source: Option<String>,

    /// Use the legacy raw TCP mode for remote capture.
    #[clap(long)]
    pub tcp: bool,

    /// Enable SSL for websocket remote capture.
    #[clap(long)]
    pub ssl: bool,

    /// CA certificate to validate the remote server against.
    #[clap(long = "ssl-certificate")]
    pub ssl_certificate: Option<PathBuf>,

    /// Username for websocket remote capture.
    #[clap(long)]
    pub user: Option<String>,

    /// Password for websocket remote capture.
    #[clap(long)]
    pub password: Option<String>,

    /// API key for websocket remote capture, instead of user/password.
    #[clap(long)]
    pub apikey: Option<String>,

    /// Endpoint path for websocket remote capture.
    #[clap(long, default_value = "/datasource/remote/remotesource.ws")]
    pub endpoint: String,
}

impl CommonArgs {
    /// Resolves the arguments into a transport endpoint.
    ///
    /// `Ok(None)` means neither a descriptor pair nor a remote target was
    /// supplied; the helper should print its usage note and exit with
    /// status 0.
    pub fn resolve(&self) -> Result<Option<Endpoint>, ArgsError> {
        if let (Some(in_fd), Some(out_fd)) = (self.in_fd, self.out_fd) {
            return Ok(Some(Endpoint::Pipe { in_fd, out_fd }));
        }

        let Some(connect) = &self.connect
        else {
            return Ok(None);
        };

        let (host, port) = connect
            .rsplit_once(':')
            .and_then(|(host, port)| Some((host, port.parse::<u16>().ok()?)))
            .ok_or_else(|| {
                ArgsError::InvalidConnect {
                    connect: connect.clone(),
                }
            })?;

        if self.tcp {
            return Ok(Some(Endpoint::Tcp {
                host: host.to_owned(),
                port,
            }));
        }

        let auth = match (&self.user, &self.password, &self.apikey) {
            (Some(user), Some(password), _) => {
                WsAuth::UserPassword {
                    user: user.clone(),
                    password: password.clone(),
                }
            }
            (_, _, Some(apikey)) => {
                WsAuth::ApiKey {
                    apikey: apikey.clone(),
                }
            }
            _ => return Err(ArgsError::MissingAuth),
        };

        Ok(Some(Endpoint::WebSocket {
            host: host.to_owned(),
            port,
            endpoint: self.endpoint.clone(),
            auth,
            ssl: self.ssl,
            ca_certificate: self.ssl_certificate.clone(),
        }))
    }
}

/// The host's configuration directory from the `KISMET_ETC` environment
/// variable; an unset variable is not an error and yields an empty string.
pub fn etc_directory() -> String {
    std::env::var("KISMET_ETC").unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use wavecap_external::transport::{
        Endpoint,
        WsAuth,
    };

    use super::{
        ArgsError,
        CommonArgs,
    };

    fn args() -> CommonArgs {
        CommonArgs {
            in_fd: None,
            out_fd: None,
            connect: None,
            source: None,
            tcp: false,
            ssl: false,
            ssl_certificate: None,
            user: None,
            password: None,
            apikey: None,
            endpoint: "/datasource/remote/remotesource.ws".to_owned(),
        }
    }

    #[test]
    fn no_arguments_resolve_to_usage() {
        assert!(args().resolve().unwrap().is_none());
    }

    #[test]
    fn descriptor_pair_resolves_to_pipe() {
        let mut args = args();
        args.in_fd = Some(3);
        args.out_fd = Some(4);

        match args.resolve().unwrap().unwrap() {
            Endpoint::Pipe { in_fd: 3, out_fd: 4 } => {}
            other => panic!("expected pipe endpoint, got {other:?}"),
        }
    }

    #[test]
    fn connect_with_tcp_flag_resolves_to_tcp() {
        let mut args = args();
        args.connect = Some("monitor.example.com:3501".to_owned());
        args.tcp = true;

        match args.resolve().unwrap().unwrap() {
            Endpoint::Tcp { host, port } => {
                assert_eq!(host, "monitor.example.com");
                assert_eq!(port, 3501);
            }
            other => panic!("expected tcp endpoint, got {other:?}"),
        }
    }

    #[test]
    fn connect_resolves_to_websocket_with_apikey() {
        let mut args = args();
        args.connect = Some("monitor.example.com:2501".to_owned());
        args.apikey = Some("secret".to_owned());

        match args.resolve().unwrap().unwrap() {
            Endpoint::WebSocket { host, port, auth, .. } => {
                assert_eq!(host, "monitor.example.com");
                assert_eq!(port, 2501);
                assert_eq!(
                    auth,
                    WsAuth::ApiKey {
                        apikey: "secret".to_owned()
                    }
                );
            }
            other => panic!("expected websocket endpoint, got {other:?}"),
        }
    }

    #[test]
    fn websocket_without_credentials_is_an_error() {
        let mut args = args();
        args.connect = Some("monitor.example.com:2501".to_owned());

        assert!(matches!(args.resolve(), Err(ArgsError::MissingAuth)));
    }

    #[test]
    fn malformed_connect_is_an_error() {
        let mut args = args();
        args.connect = Some("noport".to_owned());

        assert!(matches!(
            args.resolve(),
            Err(ArgsError::InvalidConnect { .. })
        ));
    }
}
