#![doc = include_str!("../README.md")]
#![forbid(unsafe_op_in_unsafe_fn)]

pub use waxwing_core::*;

/// Convenient imports for applications.
///
/// ```ignore
/// use waxwing::prelude::*;
/// ```
pub mod prelude {
    pub use waxwing_core::{
        Channel, ChannelStatus, CloseDecision, ConnOptions, Connection, Ctx, Error, FrameType,
        Listener, Message, Profile, ProfileBuilder, ReplyCode, Result, Role, StartDecision,
    };
}

/// Server-side helpers.
pub mod server {
    use waxwing_core::{Ctx, Listener, Result};

    /// Bind a BEEP listener on `addr`, given as `"host:port"`.
    ///
    /// Profiles registered on `ctx` are advertised in the greeting of
    /// every accepted connection.
    pub async fn listen(ctx: &Ctx, addr: &str) -> Result<Listener> {
        let (host, port) = split_addr(addr)?;
        Listener::bind(ctx, host, port).await
    }

    pub(crate) fn split_addr(addr: &str) -> Result<(&str, u16)> {
        let (host, port) = addr.rsplit_once(':').ok_or_else(|| {
            waxwing_core::Error::Protocol(format!("address '{}' is not host:port", addr))
        })?;
        let port: u16 = port.parse().map_err(|_| {
            waxwing_core::Error::Protocol(format!("address '{}' has a bad port", addr))
        })?;
        Ok((host.trim_matches(['[', ']']), port))
    }
}

/// Client-side helpers.
pub mod client {
    use waxwing_core::{ConnOptions, Connection, Ctx, Result};

    /// Connect to a BEEP peer at `addr`, given as `"host:port"`, and
    /// exchange greetings.
    pub async fn connect(ctx: &Ctx, addr: &str) -> Result<Connection> {
        connect_with(ctx, addr, ConnOptions::default()).await
    }

    pub async fn connect_with(ctx: &Ctx, addr: &str, opts: ConnOptions) -> Result<Connection> {
        let (host, port) = crate::server::split_addr(addr)?;
        Connection::connect_with(ctx, host, port, opts).await
    }
}
