use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use log::info;
use thiserror::Error;

/// Datastore-level failures. Address math is checked before any mutation,
/// so a failed write leaves the region untouched.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    #[error("address range out of region bounds")]
    OutOfRange,

    #[error("internal datastore fault")]
    Internal,
}

/// Storage contract for the four Modbus memory regions.
///
/// Reads may run concurrently with reads; a write is exclusive against both
/// reads and writes of the same region, so a half-applied write is never
/// observable. All operations are synchronous in-memory accesses and never
/// block on I/O.
pub trait DataStore: Send + Sync {
    fn read_coils(&self, address: u16, quantity: u16) -> Result<Vec<bool>, StoreError>;
    fn read_discrete_inputs(&self, address: u16, quantity: u16) -> Result<Vec<bool>, StoreError>;
    fn read_holding_registers(&self, address: u16, quantity: u16) -> Result<Vec<u16>, StoreError>;
    fn read_input_registers(&self, address: u16, quantity: u16) -> Result<Vec<u16>, StoreError>;
    fn write_coils(&self, address: u16, values: &[bool]) -> Result<(), StoreError>;
    fn write_holding_registers(&self, address: u16, values: &[u16]) -> Result<(), StoreError>;
}

/// One bit-valued region behind its own lock.
#[derive(Debug)]
struct BitRegion {
    cells: RwLock<Vec<bool>>,
}

/// One 16-bit-valued region behind its own lock.
#[derive(Debug)]
struct WordRegion {
    cells: RwLock<Vec<u16>>,
}

impl BitRegion {
    fn zeroed(len: usize) -> Self {
        Self {
            cells: RwLock::new(vec![false; len]),
        }
    }

    fn read(&self, address: u16, quantity: u16) -> Result<Vec<bool>, StoreError> {
        let cells = self.cells.read().map_err(|_| StoreError::Internal)?;
        let range = check_range(address, quantity, cells.len())?;
        Ok(cells[range].to_vec())
    }

    fn write(&self, address: u16, values: &[bool]) -> Result<(), StoreError> {
        let mut cells = self.cells.write().map_err(|_| StoreError::Internal)?;
        let range = check_range(address, values.len() as u16, cells.len())?;
        cells[range].copy_from_slice(values);
        Ok(())
    }
}

impl WordRegion {
    fn zeroed(len: usize) -> Self {
        Self {
            cells: RwLock::new(vec![0u16; len]),
        }
    }

    fn read(&self, address: u16, quantity: u16) -> Result<Vec<u16>, StoreError> {
        let cells = self.cells.read().map_err(|_| StoreError::Internal)?;
        let range = check_range(address, quantity, cells.len())?;
        Ok(cells[range].to_vec())
    }

    fn write(&self, address: u16, values: &[u16]) -> Result<(), StoreError> {
        let mut cells = self.cells.write().map_err(|_| StoreError::Internal)?;
        let range = check_range(address, values.len() as u16, cells.len())?;
        cells[range].copy_from_slice(values);
        Ok(())
    }
}

/// `address + quantity <= len`, never clamped.
fn check_range(
    address: u16,
    quantity: u16,
    len: usize,
) -> Result<std::ops::Range<usize>, StoreError> {
    let start = address as usize;
    let end = start + quantity as usize;
    if end > len {
        return Err(StoreError::OutOfRange);
    }
    Ok(start..end)
}

/// In-memory datastore: one zero-initialized, fixed-length instance of each
/// of the four regions.
#[derive(Debug)]
pub struct MemoryStore {
    coils: BitRegion,
    discrete_inputs: BitRegion,
    holding_registers: WordRegion,
    input_registers: WordRegion,
}

impl MemoryStore {
    pub fn new(region_size: usize) -> Self {
        info!(
            "🗄️  Initialized datastore: 4 regions x {} zeroed entries",
            region_size
        );
        Self {
            coils: BitRegion::zeroed(region_size),
            discrete_inputs: BitRegion::zeroed(region_size),
            holding_registers: WordRegion::zeroed(region_size),
            input_registers: WordRegion::zeroed(region_size),
        }
    }

    /// Server-side population of the read-only regions (process images,
    /// simulated sensors). Not reachable from the wire.
    pub fn set_discrete_inputs(&self, address: u16, values: &[bool]) -> Result<(), StoreError> {
        self.discrete_inputs.write(address, values)
    }

    pub fn set_input_registers(&self, address: u16, values: &[u16]) -> Result<(), StoreError> {
        self.input_registers.write(address, values)
    }
}

impl DataStore for MemoryStore {
    fn read_coils(&self, address: u16, quantity: u16) -> Result<Vec<bool>, StoreError> {
        self.coils.read(address, quantity)
    }

    fn read_discrete_inputs(&self, address: u16, quantity: u16) -> Result<Vec<bool>, StoreError> {
        self.discrete_inputs.read(address, quantity)
    }

    fn read_holding_registers(&self, address: u16, quantity: u16) -> Result<Vec<u16>, StoreError> {
        self.holding_registers.read(address, quantity)
    }

    fn read_input_registers(&self, address: u16, quantity: u16) -> Result<Vec<u16>, StoreError> {
        self.input_registers.read(address, quantity)
    }

    fn write_coils(&self, address: u16, values: &[bool]) -> Result<(), StoreError> {
        self.coils.write(address, values)
    }

    fn write_holding_registers(&self, address: u16, values: &[u16]) -> Result<(), StoreError> {
        self.holding_registers.write(address, values)
    }
}

/// Maps a request's unit identifier to a datastore.
///
/// The default single mode routes every unit id to the one store, matching
/// common TCP practice where the unit field is vestigial. Multi mode keys
/// stores by unit id; an absent id is an addressing failure surfaced to the
/// dispatcher.
#[derive(Clone)]
pub enum UnitRouter {
    Single(Arc<dyn DataStore>),
    Multi(HashMap<u8, Arc<dyn DataStore>>),
}

impl UnitRouter {
    pub fn single(store: Arc<dyn DataStore>) -> Self {
        UnitRouter::Single(store)
    }

    pub fn multi(stores: HashMap<u8, Arc<dyn DataStore>>) -> Self {
        UnitRouter::Multi(stores)
    }

    pub fn store_for(&self, unit_id: u8) -> Option<&Arc<dyn DataStore>> {
        match self {
            UnitRouter::Single(store) => Some(store),
            UnitRouter::Multi(stores) => stores.get(&unit_id),
        }
    }
}
