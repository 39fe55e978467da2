//! Guest-side serial device setup.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::termios::{self, BaudRate, SetArg};

use crate::config::SerialConfig;

/// Opens the serial device and puts the line into raw mode.
///
/// Returns independent `(input, output)` handles on the same device. A
/// device that is not a terminal (e.g. a plain pipe) is used as is.
pub(crate) fn open(config: &SerialConfig) -> io::Result<(tokio::fs::File, tokio::fs::File)> {
    let device = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(OFlag::O_NOCTTY.bits())
        .open(&config.path)?;
    configure(&device, config.baud)?;

    let output = device.try_clone()?;
    Ok((tokio::fs::File::from_std(device), tokio::fs::File::from_std(output)))
}

/// Raw 8N1 at `baud`, no echo, no line discipline.
fn configure(device: &File, baud: u32) -> io::Result<()> {
    let speed = baud_rate(baud)?;
    let mut tty = match termios::tcgetattr(device) {
        Ok(tty) => tty,
        Err(Errno::ENOTTY) => {
            tracing::debug!(baud, "serial device is not a terminal, skipping line setup");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    termios::cfmakeraw(&mut tty);
    termios::cfsetspeed(&mut tty, speed)?;
    termios::tcsetattr(device, SetArg::TCSANOW, &tty)?;
    Ok(())
}

/// Maps a numeric line speed to a termios constant.
fn baud_rate(baud: u32) -> io::Result<BaudRate> {
    Ok(match baud {
        9_600 => BaudRate::B9600,
        19_200 => BaudRate::B19200,
        38_400 => BaudRate::B38400,
        57_600 => BaudRate::B57600,
        115_200 => BaudRate::B115200,
        230_400 => BaudRate::B230400,
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported baud rate {baud}"),
            ));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_rates_map() {
        assert_eq!(baud_rate(115_200).unwrap(), BaudRate::B115200);
        assert_eq!(baud_rate(9_600).unwrap(), BaudRate::B9600);
        assert_eq!(
            baud_rate(12_345).unwrap_err().kind(),
            io::ErrorKind::InvalidInput
        );
    }

    #[test]
    fn regular_file_skips_line_setup() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let config = SerialConfig {
            path: file.path().to_path_buf(),
            baud: 115_200,
        };
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        runtime.block_on(async {
            assert!(open(&config).is_ok());
        });
    }

    #[test]
    fn missing_device_fails() {
        let config = SerialConfig {
            path: "/nonexistent/hvc9".into(),
            baud: 115_200,
        };
        assert_eq!(
            open(&config).unwrap_err().kind(),
            io::ErrorKind::NotFound
        );
    }
}
