// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Process-wide name tables: interned symbols and native functions.
//!
//! One [`Registry`] is created with [`Registry::init`] and handed to the
//! scheduler; task code reaches it through its task. After
//! [`Registry::shutdown`] every lookup fails with `RegistryClosed`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{Result, RuntimeError};
use crate::frame::{Cx, StepResult};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(u32);

impl Symbol {
    pub fn index(self) -> u32 {
        self.0
    }
}

/// A host function callable from task code. It runs on the calling task's
/// worker and may suspend like any frame.
pub type NativeFn = Arc<dyn Fn(&Cx<'_>, &[Value]) -> StepResult + Send + Sync>;

#[derive(Default)]
struct Tables {
    names: Vec<Arc<str>>,
    symbols: HashMap<Arc<str>, Symbol>,
    natives: HashMap<Symbol, NativeFn>,
}

impl Tables {
    fn intern(&mut self, name: &str) -> Symbol {
        if let Some(sym) = self.symbols.get(name) {
            return *sym;
        }
        let sym = Symbol(self.names.len() as u32);
        let name: Arc<str> = Arc::from(name);
        self.names.push(name.clone());
        self.symbols.insert(name, sym);
        sym
    }
}

pub struct Registry {
    tables: RwLock<Option<Tables>>,
}

impl Registry {
    pub fn init() -> Arc<Self> {
        debug!("registry initialized");
        Arc::new(Self {
            tables: RwLock::new(Some(Tables::default())),
        })
    }

    /// Drop every table. Idempotent.
    pub fn shutdown(&self) {
        if self.tables.write().take().is_some() {
            debug!("registry shut down");
        }
    }

    pub fn is_open(&self) -> bool {
        self.tables.read().is_some()
    }

    pub fn intern(&self, name: &str) -> Result<Symbol> {
        if let Some(sym) = self.lookup_symbol(name)? {
            return Ok(sym);
        }
        let mut guard = self.tables.write();
        let tables = guard.as_mut().ok_or(RuntimeError::RegistryClosed)?;
        Ok(tables.intern(name))
    }

    pub fn lookup_symbol(&self, name: &str) -> Result<Option<Symbol>> {
        let guard = self.tables.read();
        let tables = guard.as_ref().ok_or(RuntimeError::RegistryClosed)?;
        Ok(tables.symbols.get(name).copied())
    }

    pub fn name_of(&self, sym: Symbol) -> Result<Option<Arc<str>>> {
        let guard = self.tables.read();
        let tables = guard.as_ref().ok_or(RuntimeError::RegistryClosed)?;
        Ok(tables.names.get(sym.0 as usize).cloned())
    }

    pub fn register_native<F>(&self, name: &str, f: F) -> Result<Symbol>
    where
        F: Fn(&Cx<'_>, &[Value]) -> StepResult + Send + Sync + 'static,
    {
        let mut guard = self.tables.write();
        let tables = guard.as_mut().ok_or(RuntimeError::RegistryClosed)?;
        let sym = tables.intern(name);
        if tables.natives.contains_key(&sym) {
            return Err(RuntimeError::DuplicateNative(name.to_string()));
        }
        tables.natives.insert(sym, Arc::new(f));
        debug!(native = name, "native registered");
        Ok(sym)
    }

    pub fn native(&self, name: &str) -> Result<NativeFn> {
        let guard = self.tables.read();
        let tables = guard.as_ref().ok_or(RuntimeError::RegistryClosed)?;
        tables
            .symbols
            .get(name)
            .and_then(|sym| tables.natives.get(sym))
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownNative(name.to_string()))
    }

    /// Look up and call a native. The table lock is released before the
    /// call, so natives may use the registry themselves.
    pub fn call_native(&self, cx: &Cx<'_>, name: &str, args: &[Value]) -> Result<StepResult> {
        let f = self.native(name)?;
        Ok(f(cx, args))
    }

    pub fn symbol_count(&self) -> usize {
        self.tables.read().as_ref().map_or(0, |t| t.names.len())
    }

    pub fn native_count(&self) -> usize {
        self.tables.read().as_ref().map_or(0, |t| t.natives.len())
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("open", &self.is_open())
            .field("symbols", &self.symbol_count())
            .field("natives", &self.native_count())
            .finish()
    }
}
