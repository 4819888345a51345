//! Lazy, function-at-a-time module materialization.
//!
//! Opening a provider parses only the skeleton: types, globals,
//! constants and the byte range of each function body. Bodies parse on
//! first request, so a client that only wants one function's code (a
//! JIT resolving a call, a linker scanning symbols) never pays for the
//! rest.

use std::collections::{HashMap, HashSet};
use std::ops::Range;

use log::debug;

use crate::context::Context;
use crate::error::Result;
use crate::ir::constant::Constant;
use crate::ir::module::Module;
use crate::ir::types::Type;
use crate::ir::FuncId;

use super::reader::{parse_function_body, parse_skeleton};

pub struct ModuleProvider {
    bytes: Vec<u8>,
    module: Module,
    types: Vec<Type>,
    consts: Vec<Constant>,
    bodies: HashMap<FuncId, Range<usize>>,
    materialized: HashSet<FuncId>,
}

impl ModuleProvider {
    /// Parse the skeleton of a bytecode buffer. No function body is
    /// touched.
    pub fn open(bytes: Vec<u8>, cx: &Context) -> Result<Self> {
        let skeleton = parse_skeleton(&bytes, cx)?;
        debug!(
            "opened module `{}`: {} globals, {} lazy bodies",
            skeleton.module.name,
            skeleton.module.globals.len(),
            skeleton.bodies.len()
        );
        Ok(Self {
            bytes,
            module: skeleton.module,
            types: skeleton.types,
            consts: skeleton.consts,
            bodies: skeleton.bodies,
            materialized: HashSet::new(),
        })
    }

    /// The module as currently materialized. Functions whose bodies have
    /// not been requested are still declarations.
    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn module_mut(&mut self) -> &mut Module {
        &mut self.module
    }

    pub fn is_materialized(&self, f: FuncId) -> bool {
        self.materialized.contains(&f) || !self.bodies.contains_key(&f)
    }

    /// Parse (and verify) one function body; a no-op if already done.
    pub fn materialize_function(&mut self, f: FuncId, cx: &Context) -> Result<()> {
        if self.is_materialized(f) {
            return Ok(());
        }
        let range = self.bodies[&f].clone();
        debug!(
            "materializing @{} ({} bytes)",
            self.module.functions[f].name,
            range.len()
        );
        let payload = self.bytes[range].to_vec();
        parse_function_body(&payload, f, &mut self.module, &self.types, &self.consts, cx)?;
        self.materialized.insert(f);
        Ok(())
    }

    /// Parse every remaining body.
    pub fn materialize_all(&mut self, cx: &Context) -> Result<()> {
        let pending: Vec<FuncId> = self
            .bodies
            .keys()
            .copied()
            .filter(|f| !self.materialized.contains(f))
            .collect();
        for f in pending {
            self.materialize_function(f, cx)?;
        }
        Ok(())
    }

    /// Materialize everything, verify, and hand over the finished
    /// module.
    pub fn into_module(mut self, cx: &Context) -> Result<Module> {
        self.materialize_all(cx)?;
        crate::ir::verifier::verify_module(&self.module, cx)?;
        Ok(self.module)
    }
}
