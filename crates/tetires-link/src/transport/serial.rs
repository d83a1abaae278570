//! Opening host serial ports

use serialport::{DataBits, FlowControl, StopBits};

use super::{LinkIo, TransportError};
use crate::config::{Parity, SerialParams};

/// Open `path` with fixed line settings and split it into reader and writer
pub(crate) fn open_serial(path: &str, params: &SerialParams) -> Result<LinkIo, TransportError> {
    let port = serialport::new(path, params.baud_rate)
        .data_bits(data_bits(params.data_bits)?)
        .stop_bits(stop_bits(params.stop_bits)?)
        .parity(parity(params.parity))
        .flow_control(FlowControl::None)
        .timeout(params.read_timeout)
        .open()?;

    let writer = port.try_clone()?;

    Ok(LinkIo {
        reader: Box::new(port),
        writer: Box::new(writer),
    })
}

fn data_bits(bits: u8) -> Result<DataBits, TransportError> {
    match bits {
        5 => Ok(DataBits::Five),
        6 => Ok(DataBits::Six),
        7 => Ok(DataBits::Seven),
        8 => Ok(DataBits::Eight),
        other => Err(TransportError::IoFailure(format!(
            "unsupported data bits: {}",
            other
        ))),
    }
}

fn stop_bits(bits: u8) -> Result<StopBits, TransportError> {
    match bits {
        1 => Ok(StopBits::One),
        2 => Ok(StopBits::Two),
        other => Err(TransportError::IoFailure(format!(
            "unsupported stop bits: {}",
            other
        ))),
    }
}

fn parity(parity: Parity) -> serialport::Parity {
    match parity {
        Parity::None => serialport::Parity::None,
        Parity::Odd => serialport::Parity::Odd,
        Parity::Even => serialport::Parity::Even,
    }
}
