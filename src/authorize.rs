// MIT License - Copyright (c) 2026 pico-sync contributors
// Telnet login handshake

use tokio::time::{sleep, Duration};
use tracing::{debug, info};

use crate::board::{Board, WaitPattern};
use crate::constants::{LOGIN_PROMPT, LOGIN_SUCCEEDED, PASSWORD_PROMPT};
use crate::error::Result;

/// Per-step timeout of the login dialogue.
const LOGIN_STEP_TIMEOUT_MS: u64 = 7_000;

/// Log in to the board's telnet server with the configured credentials.
///
/// Wrong credentials surface as `BoardError::InvalidCredentials` as soon as
/// the board complains; a board that never prompts times out.
pub async fn login(board: &Board) -> Result<()> {
    let username = board.config().username.clone();
    let password = board.config().password.clone();

    debug!("Waiting for login prompt");
    board
        .wait_for(WaitPattern::exact(LOGIN_PROMPT)?, LOGIN_STEP_TIMEOUT_MS)
        .await?;

    debug!("Sending username");
    board
        .send_wait(&username, Some(WaitPattern::exact(PASSWORD_PROMPT)?), LOGIN_STEP_TIMEOUT_MS)
        .await?;

    // The password prompt arrives before the board starts reading input
    sleep(Duration::from_millis(50)).await;

    debug!("Sending password");
    board
        .send_wait(&password, Some(WaitPattern::exact(LOGIN_SUCCEEDED)?), LOGIN_STEP_TIMEOUT_MS)
        .await?;

    info!("Logged in as {}", username);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::ReplStatus;
    use crate::config::BoardConfig;
    use crate::constants::INVALID_CREDENTIALS;
    use crate::error::BoardError;
    use crate::transport::mock::MockTransport;
    use crate::transport::TransportKind;

    fn telnet_server(password: &'static str) -> impl FnMut(&[u8]) -> Vec<u8> + Send {
        move |data: &[u8]| match data {
            b"micro\r\n" => b"\r\nPassword: ".to_vec(),
            d if d == format!("{password}\r\n").as_bytes() => {
                format!("\r\n{LOGIN_SUCCEEDED}>>> ").into_bytes()
            }
            _ => format!("\r\n{INVALID_CREDENTIALS}\r\nLogin as: ").into_bytes(),
        }
    }

    #[tokio::test]
    async fn test_login_succeeds() {
        let board = Board::new(BoardConfig::builder().ping_interval_ms(0).build());
        let (transport, events) = MockTransport::with_kind(TransportKind::Telnet, telnet_server("python"));
        transport.inject(b"MicroPython v1.22 - WiPy\r\nLogin as: ");

        board.connect_transport("192.168.4.1", transport.clone(), events).await.unwrap();

        assert_eq!(board.status().await, ReplStatus::Connected);
        assert_eq!(transport.sent_text(), "micro\r\npython\r\n");
    }

    #[tokio::test]
    async fn test_wrong_password_is_reported() {
        let board = Board::new(BoardConfig::builder().ping_interval_ms(0).password("nope").build());
        let (transport, events) = MockTransport::with_kind(TransportKind::Telnet, telnet_server("python"));
        transport.inject(b"Login as: ");

        let result = board.connect_transport("192.168.4.1", transport, events).await;

        assert!(matches!(result, Err(BoardError::InvalidCredentials)));
        assert!(!board.is_connected().await);
    }
}
