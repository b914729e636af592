//! The outward D-Bus surface.
//!
//! Listeners get a `LowMemoryWarning(y)` signal per confirmed transition and
//! can read the last confirmed code from the `MemoryPressure` property.

use anyhow::Context;
use async_trait::async_trait;
use zbus::{dbus_interface, ConnectionBuilder, InterfaceRef, SignalContext};

use crate::level::{self, Level};
use crate::monitor::Actuator;
use crate::sysrq;

pub const DBUS_NAME: &str = "org.freedesktop.LowMemoryMonitor";
pub const DBUS_PATH: &str = "/org/freedesktop/LowMemoryMonitor";

struct MonitorIface {
    level: u8,
}

#[dbus_interface(name = "org.freedesktop.LowMemoryMonitor")]
impl MonitorIface {
    /// Wire code of the last confirmed severity level, 0 before any.
    #[dbus_interface(property)]
    fn memory_pressure(&self) -> u8 {
        self.level
    }

    #[dbus_interface(signal)]
    async fn low_memory_warning(ctxt: &SignalContext<'_>, level: u8) -> zbus::Result<()>;
}

pub struct DbusActuator {
    _connection: zbus::Connection,
    iface: InterfaceRef<MonitorIface>,
}

impl DbusActuator {
    /// Claims the well-known name on the system bus and publishes the
    /// monitor object. `Error::NameTaken` means another instance already
    /// owns it.
    pub async fn connect() -> zbus::Result<Self> {
        let connection = ConnectionBuilder::system()?
            .name(DBUS_NAME)?
            .serve_at(
                DBUS_PATH,
                MonitorIface {
                    level: level::wire_byte(None),
                },
            )?
            .build()
            .await?;
        let iface = connection
            .object_server()
            .interface::<_, MonitorIface>(DBUS_PATH)
            .await?;

        Ok(Self {
            _connection: connection,
            iface,
        })
    }
}

#[async_trait]
impl Actuator for DbusActuator {
    async fn announce(&mut self, level: Level) -> anyhow::Result<()> {
        let byte = level.as_byte();
        MonitorIface::low_memory_warning(self.iface.signal_context(), byte).await?;

        let mut iface = self.iface.get_mut().await;
        iface.level = byte;
        iface
            .memory_pressure_changed(self.iface.signal_context())
            .await?;
        Ok(())
    }

    async fn trigger_oom(&mut self) -> anyhow::Result<()> {
        sysrq::trigger_oom().context("could not write to /proc/sysrq-trigger")
    }
}
