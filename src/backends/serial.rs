/*
 * SPDX-FileCopyrightText: Copyright (c) 2021-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
 * SPDX-License-Identifier: LicenseRef-NvidiaProprietary
 *
 * NVIDIA CORPORATION, its affiliates and licensors retain all intellectual
 * property and proprietary rights in and to this material, related
 * documentation and any modifications thereto. Any use, reproduction,
 * disclosure or distribution of this material and related documentation
 * without an express license agreement from NVIDIA CORPORATION or
 * its affiliates is strictly prohibited.
 */

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, SerialStream, StopBits};

use crate::config::Route;
use crate::router::{Handler, HandlerError, HandlerFuture};
use crate::session::Session;

/// Settings for the serial backend. One of `directory` and `file` selects
/// how the routing argument names the port; the `delimeter` spelling
/// matches the configuration surface.
#[derive(Debug, Deserialize)]
pub(crate) struct SerialSettings {
    directory: Option<PathBuf>,
    file: Option<PathBuf>,
    delimeter: Option<String>,
    baud_rate: Option<u32>,
    config: Option<String>,
}

/// The parsed serial line mode, e.g. `8n1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SerialMode {
    data_bits: u8,
    parity: ParityMode,
    stop_bits: StopBitsMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ParityMode {
    None,
    Even,
    Odd,
    Mark,
    Space,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopBitsMode {
    One,
    OnePointFive,
    Two,
}

/// The serial backend: exposes a physical serial port over the SSH
/// session.
pub fn backend(route: Arc<Route>) -> Handler {
    Arc::new(move |session, arg| -> HandlerFuture {
        let route = route.clone();
        Box::pin(run(route, session, arg))
    })
}

async fn run(route: Arc<Route>, session: Session, arg: String) -> Result<(), HandlerError> {
    let Session {
        context,
        pty,
        mut stdin,
        writer,
        ..
    } = session;
    let user = context.user;

    let opts: SerialSettings = super::decode_settings(&route)?;

    if opts.directory.is_none() && opts.file.is_none() {
        return Err(HandlerError::SerialEndpointMissing);
    }

    // A physical port has no window size; the PTY request is only the
    // interactive-mode indicator.
    if pty.is_none() {
        return Err(HandlerError::PtyRequired);
    }

    let delimiter = opts.delimeter.as_deref().unwrap_or(".");
    let tokens: Vec<&str> = arg.split(delimiter).collect();
    let (file, baud_token, mode_token) = resolve_endpoint(&opts, &tokens)?;

    let basename = file
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    if !route.is_allowed(&user, &[basename.as_str()]) {
        return Err(HandlerError::Unauthorized);
    }

    let (baud_rate, mode) = serial_mode(&opts, &baud_token, &mode_token)?;
    let port = open_port(&file, baud_rate, &mode)?;
    let (mut port_rx, mut port_tx) = tokio::io::split(port);

    // Pipe bytes both ways until either end closes; dropping the halves
    // closes the port on every exit path.
    let mut buf = vec![0u8; 8192];
    loop {
        tokio::select! {
            read = port_rx.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => {
                    if writer.data(&buf[..n]).await.is_err() {
                        break;
                    }
                }
                Err(error) => return Err(error.into()),
            },
            data = stdin.recv() => match data {
                Some(bytes) => {
                    if port_tx.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    Ok(())
}

/// Resolves the port path and the baud/mode tokens from the routing
/// argument. With a fixed `file` the tokens are `[baud]` or
/// `[baud, mode]`; with a `directory` they are `[name]`, `[name, baud]`,
/// or `[name, baud, mode]`.
fn resolve_endpoint(
    opts: &SerialSettings,
    tokens: &[&str],
) -> Result<(PathBuf, String, String), HandlerError> {
    if let Some(file) = &opts.file {
        let (baud, mode) = match *tokens {
            [baud] => (baud, ""),
            [baud, mode, ..] => (baud, mode),
            [] => ("", ""),
        };
        return Ok((file.clone(), baud.to_string(), mode.to_string()));
    }

    if let Some(directory) = &opts.directory {
        let (name, baud, mode) = match *tokens {
            [name] => (name, "", ""),
            [name, baud] => (name, baud, ""),
            [name, baud, mode, ..] => (name, baud, mode),
            [] => return Err(HandlerError::SerialEndpointMissing),
        };
        return Ok((directory.join(name), baud.to_string(), mode.to_string()));
    }

    Err(HandlerError::SerialEndpointMissing)
}

/// Combines the argument-supplied baud and mode tokens with the route's
/// configured fallbacks. A missing value with no fallback is an error.
fn serial_mode(
    opts: &SerialSettings,
    baud_token: &str,
    mode_token: &str,
) -> Result<(u32, SerialMode), HandlerError> {
    let mode = if mode_token.is_empty() {
        let Some(config) = &opts.config else {
            return Err(HandlerError::SerialModeMissing);
        };
        parse_serial_mode(config)?
    } else {
        parse_serial_mode(mode_token)?
    };

    let baud_rate = if baud_token.is_empty() {
        opts.baud_rate.ok_or(HandlerError::BaudRateMissing)?
    } else {
        baud_token
            .parse()
            .map_err(|error| HandlerError::InvalidBaudRate {
                value: baud_token.to_string(),
                error,
            })?
    };

    Ok((baud_rate, mode))
}

/// Parses a serial mode string like `8n1`: one digit of data bits, a
/// parity letter (`n`/`e`/`o`/`m`/`s`), and `1`, `1.5`, or `2` stop bits.
/// Case-insensitive.
fn parse_serial_mode(mode: &str) -> Result<SerialMode, HandlerError> {
    let mode = mode.to_ascii_lowercase();
    let mut chars = mode.chars();
    let (Some(data), Some(parity)) = (chars.next(), chars.next()) else {
        return Err(HandlerError::InvalidSerialMode(mode));
    };
    let stop = chars.as_str();

    let data_bits = data
        .to_digit(10)
        .ok_or_else(|| HandlerError::InvalidSerialMode(mode.clone()))? as u8;

    let parity = match parity {
        'n' => ParityMode::None,
        'e' => ParityMode::Even,
        'o' => ParityMode::Odd,
        'm' => ParityMode::Mark,
        's' => ParityMode::Space,
        other => return Err(HandlerError::UnknownParity(other)),
    };

    let stop_bits = match stop {
        "1" => StopBitsMode::One,
        "1.5" => StopBitsMode::OnePointFive,
        "2" => StopBitsMode::Two,
        other => return Err(HandlerError::UnsupportedStopBits(other.to_string())),
    };

    Ok(SerialMode {
        data_bits,
        parity,
        stop_bits,
    })
}

fn open_port(path: &Path, baud_rate: u32, mode: &SerialMode) -> Result<SerialStream, HandlerError> {
    let data_bits = match mode.data_bits {
        5 => DataBits::Five,
        6 => DataBits::Six,
        7 => DataBits::Seven,
        8 => DataBits::Eight,
        other => {
            return Err(HandlerError::UnsupportedSerialOption(format!(
                "{other} data bits"
            )))
        }
    };

    let parity = match mode.parity {
        ParityMode::None => Parity::None,
        ParityMode::Even => Parity::Even,
        ParityMode::Odd => Parity::Odd,
        ParityMode::Mark => {
            return Err(HandlerError::UnsupportedSerialOption(
                "mark parity".to_string(),
            ))
        }
        ParityMode::Space => {
            return Err(HandlerError::UnsupportedSerialOption(
                "space parity".to_string(),
            ))
        }
    };

    let stop_bits = match mode.stop_bits {
        StopBitsMode::One => StopBits::One,
        StopBitsMode::Two => StopBits::Two,
        StopBitsMode::OnePointFive => {
            return Err(HandlerError::UnsupportedSerialOption(
                "1.5 stop bits".to_string(),
            ))
        }
    };

    let port = tokio_serial::new(path.to_string_lossy(), baud_rate)
        .data_bits(data_bits)
        .parity(parity)
        .stop_bits(stop_bits)
        .open_native_async()?;
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(
        directory: Option<&str>,
        file: Option<&str>,
        baud_rate: Option<u32>,
        config: Option<&str>,
    ) -> SerialSettings {
        SerialSettings {
            directory: directory.map(PathBuf::from),
            file: file.map(PathBuf::from),
            delimeter: None,
            baud_rate,
            config: config.map(|c| c.to_string()),
        }
    }

    #[test]
    fn test_parse_serial_mode() {
        assert_eq!(
            parse_serial_mode("8n1").unwrap(),
            SerialMode {
                data_bits: 8,
                parity: ParityMode::None,
                stop_bits: StopBitsMode::One,
            }
        );
        assert_eq!(
            parse_serial_mode("7e1.5").unwrap(),
            SerialMode {
                data_bits: 7,
                parity: ParityMode::Even,
                stop_bits: StopBitsMode::OnePointFive,
            }
        );
        assert_eq!(
            parse_serial_mode("8O2").unwrap(),
            SerialMode {
                data_bits: 8,
                parity: ParityMode::Odd,
                stop_bits: StopBitsMode::Two,
            }
        );
    }

    #[test]
    fn test_parse_serial_mode_errors() {
        assert!(matches!(
            parse_serial_mode("8x1"),
            Err(HandlerError::UnknownParity('x'))
        ));
        assert!(matches!(
            parse_serial_mode("8n3"),
            Err(HandlerError::UnsupportedStopBits(_))
        ));
        assert!(matches!(
            parse_serial_mode("xn1"),
            Err(HandlerError::InvalidSerialMode(_))
        ));
        assert!(matches!(
            parse_serial_mode(""),
            Err(HandlerError::InvalidSerialMode(_))
        ));
    }

    #[test]
    fn test_directory_endpoint() {
        let opts = settings(Some("/dev"), None, Some(115200), Some("8n1"));

        let (file, baud, mode) = resolve_endpoint(&opts, &["ttyS0"]).unwrap();
        assert_eq!(file, PathBuf::from("/dev/ttyS0"));
        assert_eq!((baud.as_str(), mode.as_str()), ("", ""));

        let (file, baud, mode) = resolve_endpoint(&opts, &["ttyS0", "9600"]).unwrap();
        assert_eq!(file, PathBuf::from("/dev/ttyS0"));
        assert_eq!((baud.as_str(), mode.as_str()), ("9600", ""));

        let (_, baud, mode) = resolve_endpoint(&opts, &["ttyS0", "9600", "7e1"]).unwrap();
        assert_eq!((baud.as_str(), mode.as_str()), ("9600", "7e1"));
    }

    #[test]
    fn test_file_endpoint() {
        let opts = settings(None, Some("/dev/ttyUSB0"), None, None);

        let (file, baud, mode) = resolve_endpoint(&opts, &["9600"]).unwrap();
        assert_eq!(file, PathBuf::from("/dev/ttyUSB0"));
        assert_eq!((baud.as_str(), mode.as_str()), ("9600", ""));

        let (_, baud, mode) = resolve_endpoint(&opts, &["9600", "8n1"]).unwrap();
        assert_eq!((baud.as_str(), mode.as_str()), ("9600", "8n1"));
    }

    #[test]
    fn test_mode_and_baud_fallbacks() {
        let opts = settings(Some("/dev"), None, Some(115200), Some("8n1"));

        // Argument tokens override the configured defaults.
        let (baud, mode) = serial_mode(&opts, "9600", "7e1").unwrap();
        assert_eq!(baud, 9600);
        assert_eq!(mode.data_bits, 7);

        let (baud, mode) = serial_mode(&opts, "", "").unwrap();
        assert_eq!(baud, 115200);
        assert_eq!(mode.data_bits, 8);

        let bare = settings(Some("/dev"), None, None, None);
        assert!(matches!(
            serial_mode(&bare, "9600", ""),
            Err(HandlerError::SerialModeMissing)
        ));
        assert!(matches!(
            serial_mode(&bare, "", "8n1"),
            Err(HandlerError::BaudRateMissing)
        ));
        assert!(matches!(
            serial_mode(&bare, "bad", "8n1"),
            Err(HandlerError::InvalidBaudRate { .. })
        ));
    }
}
