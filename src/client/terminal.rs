use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use nix::sys::termios::{self, SetArg};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::signal::unix::{signal, SignalKind};

use super::bridge::{Bridge, BridgeEvent};
use super::connector::Connector;

/// The escape character: Ctrl+] (0x1D)
const ESCAPE_CHAR: u8 = 0x1D;

enum Exit {
    Detached,
    Closed,
}

/// Attach the local terminal to a new remote session on `host` until the
/// shell exits or the user presses Ctrl+].
pub async fn attach(connector: Arc<Connector>, host: &str) -> Result<()> {
    let mut bridge = connector.bridge(host);
    let (cols, rows) = terminal_size();
    let id = bridge
        .connect(cols, rows)
        .await
        .with_context(|| format!("Failed to open a session on {}", host))?;
    tracing::debug!(session = %id, "Attached");

    // Save original terminal settings so we can restore on exit
    let stdin_handle = std::io::stdin();
    let orig_termios = termios::tcgetattr(&stdin_handle)
        .context("Failed to get terminal attributes (not a terminal?)")?;

    let mut raw = orig_termios.clone();
    termios::cfmakeraw(&mut raw);
    termios::tcsetattr(&stdin_handle, SetArg::TCSANOW, &raw)?;

    let result = run_terminal_bridge(&mut bridge).await;

    // Restore terminal settings regardless of how we exited
    let _ = termios::tcsetattr(&stdin_handle, SetArg::TCSANOW, &orig_termios);

    match &result {
        Ok(Exit::Detached) => eprintln!("[detached]"),
        Ok(Exit::Closed) => eprintln!("[session closed]"),
        Err(_) => {}
    }
    bridge.destroy();
    result.map(|_| ())
}

async fn run_terminal_bridge(bridge: &mut Bridge) -> Result<Exit> {
    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut stdin_buf = [0u8; 4096];

    let mut sigwinch = signal(SignalKind::window_change())?;

    loop {
        tokio::select! {
            n = stdin.read(&mut stdin_buf) => {
                let n = n.context("stdin read error")?;
                if n == 0 {
                    return Ok(Exit::Detached);
                }

                if let Some(pos) = stdin_buf[..n].iter().position(|&b| b == ESCAPE_CHAR) {
                    if pos > 0 {
                        bridge.write(Bytes::copy_from_slice(&stdin_buf[..pos]));
                    }
                    return Ok(Exit::Detached);
                }

                bridge.write(Bytes::copy_from_slice(&stdin_buf[..n]));
            }

            event = bridge.next_event() => {
                match event {
                    Some(BridgeEvent::Data(data)) => {
                        stdout.write_all(&data).await?;
                        stdout.flush().await?;
                    }
                    Some(BridgeEvent::Title { process, cols, rows }) => {
                        stdout.write_all(window_title(&process, cols, rows).as_bytes()).await?;
                        stdout.flush().await?;
                    }
                    Some(BridgeEvent::Connected(_)) => {}
                    Some(BridgeEvent::Destroyed) | None => return Ok(Exit::Closed),
                }
            }

            _ = sigwinch.recv() => {
                let (cols, rows) = terminal_size();
                bridge.resize(cols, rows);
            }
        }
    }
}

/// OSC 0 sequence setting the window title to `"<process> (<cols>x<rows>)"`.
fn window_title(process: &str, cols: u16, rows: u16) -> String {
    let clean: String = process.chars().filter(|c| !c.is_control()).collect();
    format!("\x1b]0;{} ({}x{})\x07", clean, cols, rows)
}

fn terminal_size() -> (u16, u16) {
    let mut ws = nix::libc::winsize {
        ws_row: 24,
        ws_col: 80,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    unsafe {
        nix::libc::ioctl(0, nix::libc::TIOCGWINSZ, &mut ws);
    }
    if ws.ws_col == 0 || ws.ws_row == 0 {
        return (80, 24);
    }
    (ws.ws_col, ws.ws_row)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_title() {
        assert_eq!(window_title("vim", 100, 40), "\x1b]0;vim (100x40)\x07");
        assert_eq!(window_title("b\x07ad", 80, 24), "\x1b]0;bad (80x24)\x07");
    }
}
