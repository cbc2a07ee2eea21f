//! Connection establishment primitives used by the retry engine

use std::ops::{BitOr, BitOrAssign};

use async_trait::async_trait;

use crate::config::ConnectionSettings;
use crate::traits::DriverError;

/// Client flags for [`Connector::real_connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ConnectFlags(u32);

impl ConnectFlags {
    /// No flags
    pub const NONE: Self = Self(0);
    /// Use compression on the wire
    pub const COMPRESS: Self = Self(1 << 0);
    /// Encrypt the connection
    pub const SSL: Self = Self(1 << 1);
    /// Report matched rather than changed rows for UPDATE
    pub const FOUND_ROWS: Self = Self(1 << 2);

    /// Raw bit value
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether every flag in `other` is set
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ConnectFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ConnectFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Opens and validates connections.
///
/// Opening never fails outright: like a classic client constructor it always
/// yields a handle, and [`Connector::connect_error`] tells whether the handle
/// is actually usable.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connection handle produced by this connector.
    type Conn: Send + Sync;

    /// Allocate a handle that is not connected yet.
    fn init(&self) -> Self::Conn;

    /// Open a new connection with `settings`.
    async fn open(&self, settings: &ConnectionSettings) -> Self::Conn;

    /// Connect an allocated handle. Returns `false` when the attempt failed.
    async fn real_connect(
        &self,
        conn: &mut Self::Conn,
        settings: &ConnectionSettings,
        flags: ConnectFlags,
    ) -> bool;

    /// Liveness check.
    async fn ping(&self, conn: &mut Self::Conn) -> Result<(), DriverError>;

    /// The error of the last connection attempt, if it failed.
    fn connect_error(&self, conn: &Self::Conn) -> Option<DriverError>;
}
