use log::{debug, warn};

use crate::modbus::frame::RequestFrame;
use crate::modbus::pdu::{
    exception_pdu, ExceptionCode, FunctionCode, QuantityLimits, Request, Response, COIL_OFF,
    COIL_ON,
};
use crate::storage::datastore::{DataStore, StoreError, UnitRouter};

/// Maps decoded frames to datastore operations and produces response PDUs.
///
/// Every decodable request yields exactly one PDU: either the data response
/// or a well-formed exception. Validation is ordered and the first failure
/// wins with no partial side effects: unknown function, then payload shape
/// and quantity limits, then address range, then execution.
pub struct RequestDispatcher {
    router: UnitRouter,
    limits: QuantityLimits,
}

impl RequestDispatcher {
    pub fn new(router: UnitRouter, limits: QuantityLimits) -> Self {
        Self { router, limits }
    }

    /// Handle one request frame and return the response PDU bytes.
    pub fn dispatch(&self, frame: &RequestFrame) -> Vec<u8> {
        match self.execute(frame) {
            Ok(response) => response.encode(),
            Err(code) => {
                warn!(
                    "⚠️  Exception for tx={} fc=0x{:02x}: {:?}",
                    frame.transaction_id, frame.function, code
                );
                exception_pdu(frame.function, code)
            }
        }
    }

    fn execute(&self, frame: &RequestFrame) -> Result<Response, ExceptionCode> {
        let store = self
            .router
            .store_for(frame.unit_id)
            .ok_or(ExceptionCode::GatewayTargetFailedToRespond)?;

        let request = Request::parse(frame.function, &frame.payload, &self.limits)?;
        debug!("dispatching {:?} for unit {}", request, frame.unit_id);

        match request {
            Request::ReadCoils { address, quantity } => {
                let values = store.read_coils(address, quantity).map_err(store_err)?;
                Ok(Response::Bits {
                    function: FunctionCode::ReadCoils,
                    values,
                })
            }
            Request::ReadDiscreteInputs { address, quantity } => {
                let values = store
                    .read_discrete_inputs(address, quantity)
                    .map_err(store_err)?;
                Ok(Response::Bits {
                    function: FunctionCode::ReadDiscreteInputs,
                    values,
                })
            }
            Request::ReadHoldingRegisters { address, quantity } => {
                let values = store
                    .read_holding_registers(address, quantity)
                    .map_err(store_err)?;
                Ok(Response::Registers {
                    function: FunctionCode::ReadHoldingRegisters,
                    values,
                })
            }
            Request::ReadInputRegisters { address, quantity } => {
                let values = store
                    .read_input_registers(address, quantity)
                    .map_err(store_err)?;
                Ok(Response::Registers {
                    function: FunctionCode::ReadInputRegisters,
                    values,
                })
            }
            Request::WriteSingleCoil { address, value } => {
                store.write_coils(address, &[value]).map_err(store_err)?;
                Ok(Response::Echo {
                    function: FunctionCode::WriteSingleCoil,
                    address,
                    raw_value: if value { COIL_ON } else { COIL_OFF },
                })
            }
            Request::WriteSingleRegister { address, value } => {
                store
                    .write_holding_registers(address, &[value])
                    .map_err(store_err)?;
                Ok(Response::Echo {
                    function: FunctionCode::WriteSingleRegister,
                    address,
                    raw_value: value,
                })
            }
            Request::WriteMultipleCoils { address, values } => {
                store.write_coils(address, &values).map_err(store_err)?;
                Ok(Response::WriteAck {
                    function: FunctionCode::WriteMultipleCoils,
                    address,
                    quantity: values.len() as u16,
                })
            }
            Request::WriteMultipleRegisters { address, values } => {
                store
                    .write_holding_registers(address, &values)
                    .map_err(store_err)?;
                Ok(Response::WriteAck {
                    function: FunctionCode::WriteMultipleRegisters,
                    address,
                    quantity: values.len() as u16,
                })
            }
            Request::ReadWriteMultipleRegisters {
                read_address,
                read_quantity,
                write_address,
                write_values,
            } => {
                // Validate both ranges, then write, then read: a bad read
                // range must not leave a half-applied write.
                store
                    .read_holding_registers(read_address, read_quantity)
                    .map_err(store_err)?;
                store
                    .write_holding_registers(write_address, &write_values)
                    .map_err(store_err)?;
                let values = store
                    .read_holding_registers(read_address, read_quantity)
                    .map_err(store_err)?;
                Ok(Response::Registers {
                    function: FunctionCode::ReadWriteMultipleRegisters,
                    values,
                })
            }
        }
    }
}

fn store_err(err: StoreError) -> ExceptionCode {
    match err {
        StoreError::OutOfRange => ExceptionCode::IllegalDataAddress,
        StoreError::Internal => ExceptionCode::ServerDeviceFailure,
    }
}
