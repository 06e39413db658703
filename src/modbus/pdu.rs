use log::debug;
use serde::{Deserialize, Serialize};

/// Largest PDU the wire format allows: 253 bytes (256 minus unit id,
/// function code is counted inside).
pub const MAX_PDU_SIZE: usize = 253;

/// Coil value encoding for Write Single Coil (0x05).
pub const COIL_ON: u16 = 0xFF00;
pub const COIL_OFF: u16 = 0x0000;

/// Function codes handled by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FunctionCode {
    ReadCoils = 0x01,
    ReadDiscreteInputs = 0x02,
    ReadHoldingRegisters = 0x03,
    ReadInputRegisters = 0x04,
    WriteSingleCoil = 0x05,
    WriteSingleRegister = 0x06,
    WriteMultipleCoils = 0x0F,
    WriteMultipleRegisters = 0x10,
    ReadWriteMultipleRegisters = 0x17,
}

impl FunctionCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::ReadCoils),
            0x02 => Some(Self::ReadDiscreteInputs),
            0x03 => Some(Self::ReadHoldingRegisters),
            0x04 => Some(Self::ReadInputRegisters),
            0x05 => Some(Self::WriteSingleCoil),
            0x06 => Some(Self::WriteSingleRegister),
            0x0F => Some(Self::WriteMultipleCoils),
            0x10 => Some(Self::WriteMultipleRegisters),
            0x17 => Some(Self::ReadWriteMultipleRegisters),
            _ => None,
        }
    }
}

/// Modbus exception codes returned in exception responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExceptionCode {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
    GatewayTargetFailedToRespond = 0x0B,
}

/// Per-request quantity maxima. Protocol-standard values, overridable from
/// the config file since devices in the field sometimes need looser caps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuantityLimits {
    pub max_read_bits: u16,
    pub max_write_bits: u16,
    pub max_read_registers: u16,
    pub max_write_registers: u16,
    pub max_read_write_read: u16,
    pub max_read_write_write: u16,
}

impl Default for QuantityLimits {
    fn default() -> Self {
        Self {
            max_read_bits: 2000,
            max_write_bits: 1968,
            max_read_registers: 125,
            max_write_registers: 123,
            max_read_write_read: 125,
            max_read_write_write: 121,
        }
    }
}

/// A validated request PDU. Parsing enforces payload shape and quantity
/// limits; address range checks happen later against the datastore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    ReadCoils { address: u16, quantity: u16 },
    ReadDiscreteInputs { address: u16, quantity: u16 },
    ReadHoldingRegisters { address: u16, quantity: u16 },
    ReadInputRegisters { address: u16, quantity: u16 },
    WriteSingleCoil { address: u16, value: bool },
    WriteSingleRegister { address: u16, value: u16 },
    WriteMultipleCoils { address: u16, values: Vec<bool> },
    WriteMultipleRegisters { address: u16, values: Vec<u16> },
    ReadWriteMultipleRegisters {
        read_address: u16,
        read_quantity: u16,
        write_address: u16,
        write_values: Vec<u16>,
    },
}

impl Request {
    pub fn function(&self) -> FunctionCode {
        match self {
            Request::ReadCoils { .. } => FunctionCode::ReadCoils,
            Request::ReadDiscreteInputs { .. } => FunctionCode::ReadDiscreteInputs,
            Request::ReadHoldingRegisters { .. } => FunctionCode::ReadHoldingRegisters,
            Request::ReadInputRegisters { .. } => FunctionCode::ReadInputRegisters,
            Request::WriteSingleCoil { .. } => FunctionCode::WriteSingleCoil,
            Request::WriteSingleRegister { .. } => FunctionCode::WriteSingleRegister,
            Request::WriteMultipleCoils { .. } => FunctionCode::WriteMultipleCoils,
            Request::WriteMultipleRegisters { .. } => FunctionCode::WriteMultipleRegisters,
            Request::ReadWriteMultipleRegisters { .. } => {
                FunctionCode::ReadWriteMultipleRegisters
            }
        }
    }

    /// Parse a request PDU (function code byte already stripped).
    ///
    /// Validation order per the dispatcher contract: unknown function first
    /// (`IllegalFunction`), then payload shape and quantity limits
    /// (`IllegalDataValue`). First failure wins.
    pub fn parse(
        function: u8,
        payload: &[u8],
        limits: &QuantityLimits,
    ) -> Result<Self, ExceptionCode> {
        let function = FunctionCode::from_u8(function).ok_or(ExceptionCode::IllegalFunction)?;

        match function {
            FunctionCode::ReadCoils => {
                let (address, quantity) = parse_addr_quantity(payload)?;
                check_quantity(quantity, limits.max_read_bits)?;
                Ok(Request::ReadCoils { address, quantity })
            }
            FunctionCode::ReadDiscreteInputs => {
                let (address, quantity) = parse_addr_quantity(payload)?;
                check_quantity(quantity, limits.max_read_bits)?;
                Ok(Request::ReadDiscreteInputs { address, quantity })
            }
            FunctionCode::ReadHoldingRegisters => {
                let (address, quantity) = parse_addr_quantity(payload)?;
                check_quantity(quantity, limits.max_read_registers)?;
                Ok(Request::ReadHoldingRegisters { address, quantity })
            }
            FunctionCode::ReadInputRegisters => {
                let (address, quantity) = parse_addr_quantity(payload)?;
                check_quantity(quantity, limits.max_read_registers)?;
                Ok(Request::ReadInputRegisters { address, quantity })
            }
            FunctionCode::WriteSingleCoil => {
                let (address, raw) = parse_addr_quantity(payload)?;
                // Only 0xFF00 (on) and 0x0000 (off) are legal; anything
                // else must not affect the output.
                let value = match raw {
                    COIL_ON => true,
                    COIL_OFF => false,
                    other => {
                        debug!("rejecting write single coil with value 0x{:04x}", other);
                        return Err(ExceptionCode::IllegalDataValue);
                    }
                };
                Ok(Request::WriteSingleCoil { address, value })
            }
            FunctionCode::WriteSingleRegister => {
                let (address, value) = parse_addr_quantity(payload)?;
                Ok(Request::WriteSingleRegister { address, value })
            }
            FunctionCode::WriteMultipleCoils => {
                if payload.len() < 5 {
                    return Err(ExceptionCode::IllegalDataValue);
                }
                let address = be_u16(&payload[0..2]);
                let quantity = be_u16(&payload[2..4]);
                let byte_count = payload[4] as usize;
                check_quantity(quantity, limits.max_write_bits)?;
                if byte_count != bit_byte_count(quantity) || payload.len() != 5 + byte_count {
                    return Err(ExceptionCode::IllegalDataValue);
                }
                let values = unpack_bits(&payload[5..], quantity);
                Ok(Request::WriteMultipleCoils { address, values })
            }
            FunctionCode::WriteMultipleRegisters => {
                if payload.len() < 5 {
                    return Err(ExceptionCode::IllegalDataValue);
                }
                let address = be_u16(&payload[0..2]);
                let quantity = be_u16(&payload[2..4]);
                let byte_count = payload[4] as usize;
                check_quantity(quantity, limits.max_write_registers)?;
                if byte_count != quantity as usize * 2 || payload.len() != 5 + byte_count {
                    return Err(ExceptionCode::IllegalDataValue);
                }
                let values = unpack_registers(&payload[5..]);
                Ok(Request::WriteMultipleRegisters { address, values })
            }
            FunctionCode::ReadWriteMultipleRegisters => {
                if payload.len() < 9 {
                    return Err(ExceptionCode::IllegalDataValue);
                }
                let read_address = be_u16(&payload[0..2]);
                let read_quantity = be_u16(&payload[2..4]);
                let write_address = be_u16(&payload[4..6]);
                let write_quantity = be_u16(&payload[6..8]);
                let byte_count = payload[8] as usize;
                check_quantity(read_quantity, limits.max_read_write_read)?;
                check_quantity(write_quantity, limits.max_read_write_write)?;
                if byte_count != write_quantity as usize * 2 || payload.len() != 9 + byte_count {
                    return Err(ExceptionCode::IllegalDataValue);
                }
                let write_values = unpack_registers(&payload[9..]);
                Ok(Request::ReadWriteMultipleRegisters {
                    read_address,
                    read_quantity,
                    write_address,
                    write_values,
                })
            }
        }
    }
}

/// A response PDU ready for encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Byte-count-prefixed packed bits (0x01, 0x02).
    Bits {
        function: FunctionCode,
        values: Vec<bool>,
    },
    /// Byte-count-prefixed registers (0x03, 0x04, 0x17).
    Registers {
        function: FunctionCode,
        values: Vec<u16>,
    },
    /// Echo of a single-write request payload (0x05, 0x06).
    Echo {
        function: FunctionCode,
        address: u16,
        raw_value: u16,
    },
    /// Address + quantity acknowledgement (0x0F, 0x10).
    WriteAck {
        function: FunctionCode,
        address: u16,
        quantity: u16,
    },
}

impl Response {
    /// Encode into PDU bytes: function code followed by data.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Response::Bits { function, values } => {
                let packed = pack_bits(values);
                let mut pdu = Vec::with_capacity(2 + packed.len());
                pdu.push(*function as u8);
                pdu.push(packed.len() as u8);
                pdu.extend_from_slice(&packed);
                pdu
            }
            Response::Registers { function, values } => {
                let mut pdu = Vec::with_capacity(2 + values.len() * 2);
                pdu.push(*function as u8);
                pdu.push((values.len() * 2) as u8);
                for value in values {
                    pdu.extend_from_slice(&value.to_be_bytes());
                }
                pdu
            }
            Response::Echo {
                function,
                address,
                raw_value,
            } => {
                let mut pdu = Vec::with_capacity(5);
                pdu.push(*function as u8);
                pdu.extend_from_slice(&address.to_be_bytes());
                pdu.extend_from_slice(&raw_value.to_be_bytes());
                pdu
            }
            Response::WriteAck {
                function,
                address,
                quantity,
            } => {
                let mut pdu = Vec::with_capacity(5);
                pdu.push(*function as u8);
                pdu.extend_from_slice(&address.to_be_bytes());
                pdu.extend_from_slice(&quantity.to_be_bytes());
                pdu
            }
        }
    }
}

/// Encode an exception PDU.
///
/// The exception function code is the request code with bit 0x80 set via a
/// plain bit-OR. For request codes that already carry bit 7 (e.g. 0x99 from
/// a confused client) the encoded byte therefore equals the original code.
pub fn exception_pdu(function: u8, code: ExceptionCode) -> Vec<u8> {
    vec![function | 0x80, code as u8]
}

/// Bytes required to pack `quantity` bits.
pub fn bit_byte_count(quantity: u16) -> usize {
    (quantity as usize + 7) / 8
}

/// Pack bits LSB-first: the LSB of the first byte is the lowest address.
pub fn pack_bits(values: &[bool]) -> Vec<u8> {
    let mut bytes = vec![0u8; (values.len() + 7) / 8];
    for (i, &value) in values.iter().enumerate() {
        if value {
            bytes[i / 8] |= 1 << (i % 8);
        }
    }
    bytes
}

/// Unpack `quantity` bits from LSB-first packed bytes.
pub fn unpack_bits(bytes: &[u8], quantity: u16) -> Vec<bool> {
    (0..quantity as usize)
        .map(|i| (bytes[i / 8] >> (i % 8)) & 0x01 == 1)
        .collect()
}

fn unpack_registers(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect()
}

fn be_u16(bytes: &[u8]) -> u16 {
    u16::from_be_bytes([bytes[0], bytes[1]])
}

fn parse_addr_quantity(payload: &[u8]) -> Result<(u16, u16), ExceptionCode> {
    if payload.len() != 4 {
        return Err(ExceptionCode::IllegalDataValue);
    }
    Ok((be_u16(&payload[0..2]), be_u16(&payload[2..4])))
}

fn check_quantity(quantity: u16, max: u16) -> Result<(), ExceptionCode> {
    if quantity == 0 || quantity > max {
        return Err(ExceptionCode::IllegalDataValue);
    }
    Ok(())
}
