//! 连接建立后的保活配置。
//!
//! Windows 上 `socket2` 通过 `SIO_KEEPALIVE_VALS` 下发与
//! [`KeepAliveConfig::control_block`] 相同布局的 12 字节控制块；其他平台映射为
//! `SO_KEEPALIVE` + `TCP_KEEPIDLE` + `TCP_KEEPINTVL`，数值保持一致。

use socket2::{SockRef, TcpKeepalive};
use tether_core::{KeepAliveConfig, Result};
use tokio::net::TcpStream;
use tracing::trace;

use crate::error::{CONFIGURE, map_setup_error};

/// 将保活参数写入套接字。
pub(crate) fn apply_keepalive(stream: &TcpStream, config: &KeepAliveConfig) -> Result<()> {
    let sock = SockRef::from(stream);
    if !config.enabled {
        return sock
            .set_keepalive(false)
            .map_err(|err| map_setup_error(CONFIGURE, err));
    }

    let params = TcpKeepalive::new().with_time(config.time);
    #[cfg(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        windows
    ))]
    let params = params.with_interval(config.interval);

    sock.set_tcp_keepalive(&params)
        .map_err(|err| map_setup_error(CONFIGURE, err))?;
    trace!(
        control_block = ?config.control_block(),
        "keepalive configured"
    );
    Ok(())
}
