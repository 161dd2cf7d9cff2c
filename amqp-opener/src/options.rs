use std::path::PathBuf;

/// Options controlling TLS connections and certificate based
/// authentication
#[derive(Clone, Debug, Default)]
pub(crate) struct TlsArgs {
    /// PEM formatted CA certificate chain. The bundled web PKI roots
    /// are used when this is not given
    pub(crate) ca_cert: Option<PathBuf>,

    /// PEM formatted client certificate
    pub(crate) cert: Option<PathBuf>,

    /// PEM formatted private key matching `cert`
    pub(crate) key: Option<PathBuf>,

    /// Name the server certificate is verified against. Defaults to
    /// the host in the URL
    pub(crate) domain: Option<String>,
}

/// Server authentication method
#[derive(Clone, Debug)]
pub(crate) enum AuthMethod {
    /// Plain username/password authentication
    Plain(AmqpPlainAuth),
    /// External certificate based authentication
    External,
}

/// Username/password data for AMQP PLAIN auth method
#[derive(Clone, Debug, Default)]
pub(crate) struct AmqpPlainAuth {
    /// Username for the server
    pub(crate) amqp_user: String,

    /// Password given as plain text
    pub(crate) amqp_password: Option<String>,

    /// Plain text file containing the password. A single trailing
    /// newline will be removed
    pub(crate) amqp_password_file: Option<PathBuf>,

    /// Ask on the terminal if no other password source is available
    pub(crate) prompt: bool,
}

impl AmqpPlainAuth {
    /// Return the password for PLAIN auth, or None if no password is
    /// given. Returns an io error if the password file is given but
    /// can't be read
    pub(crate) fn password(&self) -> std::io::Result<Option<String>> {
        if let Some(pfile) = &self.amqp_password_file {
            let p = std::fs::read_to_string(pfile)?;
            let p = p.strip_suffix('\n').unwrap_or(&p);
            return Ok(Some(p.to_string()));
        }
        Ok(self.amqp_password.clone())
    }
}

/// Everything collected by the builder needed to make an
/// [`crate::Opener`]
#[derive(Clone, Debug, Default)]
pub(crate) struct OpenerConfig {
    /// URL of the server, including credentials, vhost and query
    pub(crate) url: String,

    /// Authentication overriding whatever the URL says
    pub(crate) auth: Option<AuthMethod>,

    /// TLS options. `Some` forces a TLS connection even for `amqp://`
    pub(crate) tls: Option<TlsArgs>,

    /// Heartbeat interval in seconds. Overrides `?heartbeat=`
    pub(crate) heartbeat: Option<u16>,

    /// Name reported to the server in the connection properties
    pub(crate) connection_name: Option<String>,
}
