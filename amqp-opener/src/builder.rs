//! Builder for making (optionally TLS) RabbitMQ connections using
//! [`amqprs`] with PLAIN or EXTERNAL authentication

use std::marker::PhantomData;
use std::path::Path;

use crate::connection::{Opener, Result};
use crate::options::{AmqpPlainAuth, AuthMethod, OpenerConfig, TlsArgs};

/// Builder to make an [`Opener`], from which you can open an
/// [`amqprs::connection::Connection`]
pub struct ConnectionBuilder<Auth: AuthType> {
    #[doc(hidden)]
    config: OpenerConfig,
    #[doc(hidden)]
    _marker: PhantomData<Auth>,
}

/// Marker trait for [`ConnectionBuilder`] typestate. You can't make
/// this yourself
#[doc(hidden)]
pub trait AuthType: private::Sealed {}

impl AuthType for auth::Plain {}
impl AuthType for auth::External {}
impl AuthType for auth::None {}

#[doc(hidden)]
mod private {
    pub trait Sealed {}
}

impl private::Sealed for auth::None {}
impl private::Sealed for auth::Plain {}
impl private::Sealed for auth::External {}

#[doc(hidden)]
pub mod auth {
    pub struct None;
    pub struct Plain;
    pub struct External;
}

impl ConnectionBuilder<auth::None> {
    /// Start building a new RabbitMQ connection to the given URL.
    /// Connection parameters can be given in the URL, but parameters
    /// given in the builder will override those.
    pub fn new(url: &str) -> Self {
        Self {
            config: OpenerConfig {
                url: url.to_string(),
                ..Default::default()
            },
            _marker: PhantomData,
        }
    }

    /// Use EXTERNAL auth. If you call this, you essentially have to
    /// call [`ConnectionBuilder::with_client_cert`]
    pub fn external_auth(mut self) -> ConnectionBuilder<auth::External> {
        self.config.auth = Some(AuthMethod::External);
        self.config.tls.get_or_insert_with(TlsArgs::default);
        self.retype()
    }

    /// Use PLAIN (username/password) authentication
    pub fn plain_auth(mut self, user: &str) -> ConnectionBuilder<auth::Plain> {
        self.config.auth = Some(AuthMethod::Plain(AmqpPlainAuth {
            amqp_user: user.to_string(),
            ..Default::default()
        }));
        self.retype()
    }
}

impl<Auth: AuthType> ConnectionBuilder<Auth> {
    /// Change the typestate, keeping the collected options
    fn retype<Next: AuthType>(self) -> ConnectionBuilder<Next> {
        ConnectionBuilder {
            config: self.config,
            _marker: PhantomData,
        }
    }

    /// The TLS options, switching TLS on if it wasn't already
    fn tls_args(&mut self) -> &mut TlsArgs {
        self.config.tls.get_or_insert_with(TlsArgs::default)
    }

    /// Use a TLS connection. This is implied by an `amqps://` URL and
    /// by [`ConnectionBuilder::with_ca_pem`]
    pub fn tls(mut self) -> Self {
        self.tls_args();
        self
    }

    /// Verify the server using the given CA certificate file, in PEM
    /// format. Implies [`ConnectionBuilder::tls`].
    pub fn with_ca_pem(mut self, ca_cert: impl AsRef<Path>) -> Self {
        self.tls_args().ca_cert = Some(ca_cert.as_ref().to_owned());
        self
    }

    /// Present the PEM formatted certificate and private key to the
    /// server. Implies [`ConnectionBuilder::tls`].
    pub fn with_client_cert(mut self, cert: impl AsRef<Path>, key: impl AsRef<Path>) -> Self {
        let tls = self.tls_args();
        tls.cert = Some(cert.as_ref().to_owned());
        tls.key = Some(key.as_ref().to_owned());
        self
    }

    /// Verify the server certificate against this name instead of the
    /// URL host. Implies [`ConnectionBuilder::tls`].
    pub fn tls_domain(mut self, domain: &str) -> Self {
        self.tls_args().domain = Some(domain.to_string());
        self
    }

    /// Ask the server for heartbeats every `seconds`. Zero disables
    /// heartbeats
    pub fn heartbeat(mut self, seconds: u16) -> Self {
        self.config.heartbeat = Some(seconds);
        self
    }

    /// Name the connection. It shows up in the management UI
    pub fn connection_name(mut self, name: &str) -> Self {
        self.config.connection_name = Some(name.to_string());
        self
    }

    /// Return the configured [`crate::Opener`]
    pub fn opener(self) -> Result<Opener> {
        Opener::from_config(&self.config)
    }
}

impl ConnectionBuilder<auth::Plain> {
    /// The PLAIN options. Always present in this typestate
    fn plain(&mut self) -> Option<&mut AmqpPlainAuth> {
        match self.config.auth {
            Some(AuthMethod::Plain(ref mut plain)) => Some(plain),
            _ => None,
        }
    }

    /// Give the password as a plain text string
    pub fn with_password(mut self, password: &str) -> Self {
        if let Some(plain) = self.plain() {
            plain.amqp_password = Some(password.to_string());
        }
        self
    }

    /// Read the password from the given file
    pub fn with_password_file(mut self, password_file: impl AsRef<Path>) -> Self {
        if let Some(plain) = self.plain() {
            plain.amqp_password_file = Some(password_file.as_ref().to_owned());
        }
        self
    }

    /// Prompt on the terminal for the password if neither the builder
    /// nor the URL supplied one
    pub fn password_prompt(mut self) -> Self {
        if let Some(plain) = self.plain() {
            plain.prompt = true;
        }
        self
    }
}
