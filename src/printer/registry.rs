// src/printer/registry.rs - Caller-owned lookup of connected printers
use std::collections::BTreeMap;
use std::fmt;

use super::Printer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PrinterId(u64);

impl fmt::Display for PrinterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "printer-{}", self.0)
    }
}

/// Printers known to one application. Not global; whoever manages
/// connections owns it and hands out ids.
#[derive(Debug, Default)]
pub struct PrinterRegistry {
    printers: BTreeMap<PrinterId, Printer>,
    next_id: u64,
}

impl PrinterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, printer: Printer) -> PrinterId {
        let id = PrinterId(self.next_id);
        self.next_id += 1;
        tracing::info!("Registered {} as {}", printer.identity().identifier(), id);
        self.printers.insert(id, printer);
        id
    }

    pub fn get(&self, id: PrinterId) -> Option<&Printer> {
        self.printers.get(&id)
    }

    pub fn remove(&mut self, id: PrinterId) -> Option<Printer> {
        let removed = self.printers.remove(&id);
        if removed.is_some() {
            tracing::info!("Removed {}", id);
        }
        removed
    }

    pub fn find_by_serial(&self, serial: &str) -> Option<(PrinterId, &Printer)> {
        self.printers
            .iter()
            .find(|(_, printer)| printer.identity().serial_number.as_deref() == Some(serial))
            .map(|(id, printer)| (*id, printer))
    }

    /// Drop printers whose connection has gone away.
    pub fn prune_disconnected(&mut self) -> Vec<PrinterId> {
        let gone: Vec<PrinterId> = self
            .printers
            .iter()
            .filter(|(_, printer)| !printer.is_connected())
            .map(|(id, _)| *id)
            .collect();
        for id in &gone {
            self.remove(*id);
        }
        gone
    }

    pub fn iter(&self) -> impl Iterator<Item = (PrinterId, &Printer)> {
        self.printers.iter().map(|(id, printer)| (*id, printer))
    }

    pub fn len(&self) -> usize {
        self.printers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.printers.is_empty()
    }
}
