//! Echo server on the weft fiber runtime.
//!
//! One fiber accepts; every connection gets its own fiber that echoes
//! until EOF. Sequential-looking code, epoll underneath.
//!
//! ```text
//! WEFT_ECHO_PORT=7777 cargo run -p weft-echo
//! ```

use anyhow::{bail, Context, Result};
use weft::{libc, EventLoop, LoopConfig, LoopHandle};

fn main() -> Result<()> {
    env_logger::init();

    let port: u16 = std::env::var("WEFT_ECHO_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(7777);

    let mut lp = EventLoop::new(LoopConfig::from_env()).context("building event loop")?;
    lp.spawn(move || {
        if let Err(e) = serve(port) {
            log::error!("echo server failed: {:#}", e);
        }
    })
    .context("spawning acceptor fiber")?;

    lp.run();
    Ok(())
}

fn serve(port: u16) -> Result<()> {
    let h = LoopHandle;

    let listener = h.socket(libc::AF_INET, libc::SOCK_STREAM, 0);
    if listener < 0 {
        bail!("socket failed: {}", last_errno());
    }

    unsafe {
        let one: libc::c_int = 1;
        libc::setsockopt(
            listener,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }

    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_addr.s_addr = libc::INADDR_ANY.to_be();
    addr.sin_port = port.to_be();
    let ret = unsafe {
        libc::bind(
            listener,
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        bail!("bind to port {} failed: {}", port, last_errno());
    }
    if unsafe { libc::listen(listener, 64) } < 0 {
        bail!("listen failed: {}", last_errno());
    }
    log::info!("echoing on 0.0.0.0:{}", port);

    loop {
        let conn = unsafe { h.accept4(listener, std::ptr::null_mut(), std::ptr::null_mut(), 0) };
        if conn < 0 {
            bail!("accept failed: {}", last_errno());
        }
        log::debug!("accepted fd {}", conn);

        h.spawn(move || echo(conn))
            .context("spawning connection fiber")?;
    }
}

fn echo(conn: libc::c_int) {
    let h = LoopHandle;
    let mut buf = [0u8; 4096];

    loop {
        let n = h.read(conn, &mut buf);
        if n <= 0 {
            if n < 0 {
                log::warn!("read on fd {} failed: {}", conn, last_errno());
            }
            break;
        }

        let mut sent = 0usize;
        while sent < n as usize {
            let written = h.write(conn, &buf[sent..n as usize]);
            if written < 0 {
                log::warn!("write on fd {} failed: {}", conn, last_errno());
                h.close(conn);
                return;
            }
            sent += written as usize;
        }
    }

    h.close(conn);
    log::debug!("closed fd {}", conn);
}

fn last_errno() -> std::io::Error {
    std::io::Error::last_os_error()
}
