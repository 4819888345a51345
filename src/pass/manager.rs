//! The pass scheduler.
//!
//! Passes are added in user order. Adding a pass first synthesizes any
//! required analyses that are not already available at schedule time
//! (instantiating them through the registry, recursively). Finer-grained
//! passes are batched: consecutive function passes inside a module
//! manager collect into one child manager that walks each function once,
//! running the whole batch on it before advancing; block passes batch
//! inside function managers the same way.
//!
//! At run time the manager keeps a cache of live analysis results,
//! discards whatever a finished pass did not preserve, and frees each
//! result after its schedule-time last user has run.

use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use log::{debug, log_enabled, Level};

use crate::context::Context;
use crate::error::{Error, Result};
use crate::ir::module::Module;
use crate::ir::verifier;
use crate::ir::FuncId;
use crate::pass::{
    AnalysisCache, AnalysisId, AnalysisUsage, AnyPass, BasicBlockPass, FunctionPass, ModulePass,
    PassRegistry, Preserved,
};
use crate::settings::{PassDebugLevel, Settings};

/// Wall time per pass, aggregated by name.
#[derive(Debug, Default, Clone)]
pub struct TimingInfo {
    entries: HashMap<&'static str, Duration>,
}

impl TimingInfo {
    fn record(&mut self, name: &'static str, elapsed: Duration) {
        *self.entries.entry(name).or_default() += elapsed;
    }

    fn absorb(&mut self, other: TimingInfo) {
        for (name, d) in other.entries {
            *self.entries.entry(name).or_default() += d;
        }
    }

    /// A report sorted by descending total time.
    pub fn report(&self) -> String {
        let mut rows: Vec<_> = self.entries.iter().collect();
        rows.sort_by(|a, b| b.1.cmp(a.1));
        let mut out = String::from("pass timing:\n");
        for (name, d) in rows {
            out.push_str(&format!("  {:>10.3?}  {}\n", d, name));
        }
        out
    }

    pub fn total(&self) -> Duration {
        self.entries.values().sum()
    }
}

fn meet(a: Preserved, b: &Preserved, registry: &PassRegistry) -> Preserved {
    use Preserved::*;
    match (a, b.clone()) {
        (All, other) => other,
        (other, All) => other,
        (None, _) | (_, None) => None,
        (AllCfgOnly, AllCfgOnly) => AllCfgOnly,
        (AllCfgOnly, Set(ids)) | (Set(ids), AllCfgOnly) => {
            Set(ids.into_iter().filter(|&id| registry.is_cfg_only(id)).collect())
        }
        (Set(a), Set(b)) => Set(a.into_iter().filter(|id| b.contains(id)).collect()),
    }
}

// ---------------------------------------------------------------------------
// block-level batch
// ---------------------------------------------------------------------------

struct BlockBatch {
    passes: Vec<Box<dyn BasicBlockPass>>,
}

impl BlockBatch {
    fn merged_usage(&self, registry: &PassRegistry) -> AnalysisUsage {
        merge_usages(self.passes.iter().map(|p| p.usage()), registry)
    }

    fn run_on_function(
        &mut self,
        func: FuncId,
        module: &mut Module,
        cx: &Context,
        am: &mut AnalysisCache,
        registry: &PassRegistry,
        settings: &Settings,
        timing: &mut TimingInfo,
    ) -> Result<bool> {
        let mut changed = false;
        let blocks: Vec<_> = module.functions[func].layout().to_vec();
        for block in blocks {
            for pass in &mut self.passes {
                debug_pass(settings, "run", pass.name(), &pass.usage());
                let started = Instant::now();
                let this_changed = pass.run(block, func, module, cx, am)?;
                timing.record(pass.name(), started.elapsed());
                changed |= this_changed;
                am.invalidate(&pass.usage().preserved, registry);
            }
        }
        Ok(changed)
    }
}

fn merge_usages(
    usages: impl Iterator<Item = AnalysisUsage>,
    registry: &PassRegistry,
) -> AnalysisUsage {
    let mut merged = AnalysisUsage::new().preserves(Preserved::All);
    for usage in usages {
        for r in usage.required {
            // Satisfied inside the batch if an earlier member provides it.
            if !merged.provided.contains(&r) && !merged.required.contains(&r) {
                merged.required.push(r);
            }
        }
        merged.provided.extend(usage.provided);
        merged.preserved = meet(merged.preserved, &usage.preserved, registry);
    }
    merged
}

// ---------------------------------------------------------------------------
// function-level manager
// ---------------------------------------------------------------------------

enum FuncItem {
    Pass(Box<dyn FunctionPass>),
    Batch(BlockBatch),
}

/// Runs a sequence of function (and batched block) passes over each
/// defined function of a module. Usable on its own (a JIT materializing
/// one function at a time drives [`FunctionPassManager::run_on_function`]
/// directly) or as the batcher a [`PassManager`] synthesizes.
pub struct FunctionPassManager {
    registry: Rc<PassRegistry>,
    items: Vec<FuncItem>,
    /// Schedule-time availability inside this manager.
    available: HashMap<AnalysisId, usize>,
    /// item -> last item consuming one of its provided analyses
    last_use: HashMap<usize, usize>,
}

impl FunctionPassManager {
    pub fn new(registry: Rc<PassRegistry>) -> Self {
        Self {
            registry,
            items: Vec::new(),
            available: HashMap::new(),
            last_use: HashMap::new(),
        }
    }

    /// Add a function or block pass; module passes are rejected.
    pub fn add(&mut self, pass: AnyPass) -> Result<()> {
        match pass {
            AnyPass::Function(p) => self.add_function_pass(p),
            AnyPass::Block(p) => self.add_block_pass(p),
            AnyPass::Module(p) => Err(Error::Structural {
                value: p.name().into(),
                message: "module pass added to a function pass manager".into(),
            }),
        }
    }

    fn add_function_pass(&mut self, pass: Box<dyn FunctionPass>) -> Result<()> {
        let usage = pass.usage();
        self.satisfy_requirements(&usage)?;
        let index = self.items.len();
        self.mark_last_uses(&usage, index);
        self.items.push(FuncItem::Pass(pass));
        self.apply_to_availability(&usage, index);
        Ok(())
    }

    fn add_block_pass(&mut self, pass: Box<dyn BasicBlockPass>) -> Result<()> {
        let usage = pass.usage();
        self.satisfy_requirements(&usage)?;
        let index = match self.items.last_mut() {
            Some(FuncItem::Batch(_)) => self.items.len() - 1,
            _ => {
                self.items.push(FuncItem::Batch(BlockBatch { passes: Vec::new() }));
                self.items.len() - 1
            }
        };
        self.mark_last_uses(&usage, index);
        if let Some(FuncItem::Batch(batch)) = self.items.last_mut() {
            batch.passes.push(pass);
        }
        self.apply_to_availability(&usage, index);
        Ok(())
    }

    fn satisfy_requirements(&mut self, usage: &AnalysisUsage) -> Result<()> {
        for &r in &usage.required {
            if self.available.contains_key(r) {
                continue;
            }
            let synthesized = self.registry.create(r).ok_or_else(|| Error::Unresolved(
                format!("required analysis `{r}` is not registered"),
            ))?;
            match synthesized {
                AnyPass::Function(p) => self.add_function_pass(p)?,
                AnyPass::Block(p) => self.add_block_pass(p)?,
                AnyPass::Module(p) => {
                    // The module-level requirement must have been scheduled
                    // by the parent before this batch; reaching here means
                    // the batch is being used standalone without it.
                    return Err(Error::Unresolved(format!(
                        "analysis `{}` is module-level and cannot be computed inside \
                         a function pipeline",
                        p.name()
                    )));
                }
            }
        }
        Ok(())
    }

    fn mark_last_uses(&mut self, usage: &AnalysisUsage, consumer: usize) {
        for &r in &usage.required {
            if let Some(&provider) = self.available.get(r) {
                self.last_use.insert(provider, consumer);
            }
        }
    }

    fn apply_to_availability(&mut self, usage: &AnalysisUsage, index: usize) {
        let registry = self.registry.clone();
        self.available
            .retain(|&id, _| usage.preserved.covers(id, registry.is_cfg_only(id)));
        for &p in &usage.provided {
            self.available.insert(p, index);
        }
    }

    pub(crate) fn merged_usage(&self) -> AnalysisUsage {
        merge_usages(
            self.items.iter().map(|item| match item {
                FuncItem::Pass(p) => p.usage(),
                FuncItem::Batch(b) => b.merged_usage(&self.registry),
            }),
            &self.registry,
        )
    }

    /// Run the pipeline over every defined function.
    pub fn run(
        &mut self,
        module: &mut Module,
        cx: &Context,
        settings: &Settings,
        am: &mut AnalysisCache,
        timing: &mut TimingInfo,
    ) -> Result<bool> {
        for item in &mut self.items {
            match item {
                FuncItem::Pass(p) => p.initialize(module, cx)?,
                FuncItem::Batch(b) => {
                    for p in &mut b.passes {
                        p.initialize(module, cx)?;
                    }
                }
            }
        }
        let mut changed = false;
        let funcs: Vec<_> = module.defined_functions().collect();
        for func in funcs {
            changed |= self.run_on_function_inner(func, module, cx, settings, am, timing)?;
        }
        for item in &mut self.items {
            match item {
                FuncItem::Pass(p) => p.finalize(module, cx)?,
                FuncItem::Batch(b) => {
                    for p in &mut b.passes {
                        p.finalize(module, cx)?;
                    }
                }
            }
        }
        // Per-function analysis results describe the last function only;
        // nothing outside the batch may consume them.
        for id in self.provided_ids() {
            am.remove(id);
        }
        Ok(changed)
    }

    /// Run the pipeline over a single function (JIT-style driving).
    pub fn run_on_function(
        &mut self,
        func: FuncId,
        module: &mut Module,
        cx: &Context,
        settings: &Settings,
    ) -> Result<bool> {
        let mut am = AnalysisCache::new();
        let mut timing = TimingInfo::default();
        self.run_on_function_inner(func, module, cx, settings, &mut am, &mut timing)
    }

    fn run_on_function_inner(
        &mut self,
        func: FuncId,
        module: &mut Module,
        cx: &Context,
        settings: &Settings,
        am: &mut AnalysisCache,
        timing: &mut TimingInfo,
    ) -> Result<bool> {
        let mut changed = false;
        // Results computed for the previous function are stale.
        for id in self.provided_ids() {
            am.remove(id);
        }
        let registry = self.registry.clone();
        let mut last_user_of: HashMap<usize, Vec<usize>> = HashMap::new();
        for (&provider, &consumer) in &self.last_use {
            last_user_of.entry(consumer).or_default().push(provider);
        }
        for index in 0..self.items.len() {
            let (name, usage) = match &self.items[index] {
                FuncItem::Pass(p) => (p.name(), p.usage()),
                FuncItem::Batch(b) => ("<block batch>", b.merged_usage(&registry)),
            };
            self.check_required(&usage, am)?;
            debug_pass(settings, "run", name, &usage);
            let started = Instant::now();
            let this_changed = match &mut self.items[index] {
                FuncItem::Pass(p) => {
                    let r = p.run(func, module, cx, am)?;
                    timing.record(p.name(), started.elapsed());
                    r
                }
                FuncItem::Batch(b) => {
                    b.run_on_function(func, module, cx, am, &registry, settings, timing)?
                }
            };
            if this_changed && log_enabled!(Level::Debug) {
                debug!("pass `{name}` modified function {}", func.raw());
            }
            changed |= this_changed;
            am.invalidate(&usage.preserved, &registry);
            if settings.verify_each {
                verifier::verify_function(&module.functions[func], &module.globals, cx)?;
            }
            if let Some(providers) = last_user_of.get(&index) {
                for &provider in providers {
                    self.release_item(provider, am);
                }
            }
        }
        Ok(changed)
    }

    fn check_required(&self, usage: &AnalysisUsage, am: &AnalysisCache) -> Result<()> {
        for &r in &usage.required {
            if !am.contains(r) {
                return Err(Error::Unresolved(format!(
                    "analysis `{r}` used but not available"
                )));
            }
        }
        Ok(())
    }

    fn provided_ids(&self) -> Vec<AnalysisId> {
        self.items
            .iter()
            .flat_map(|item| match item {
                FuncItem::Pass(p) => p.usage().provided,
                FuncItem::Batch(b) => b.merged_usage(&self.registry).provided,
            })
            .collect()
    }

    fn release_item(&mut self, index: usize, am: &mut AnalysisCache) {
        let provided = match &self.items[index] {
            FuncItem::Pass(p) => p.usage().provided,
            FuncItem::Batch(b) => b.merged_usage(&self.registry).provided,
        };
        for id in provided {
            am.remove(id);
        }
        match &mut self.items[index] {
            FuncItem::Pass(p) => p.release_memory(),
            FuncItem::Batch(b) => {
                for p in &mut b.passes {
                    p.release_memory();
                }
            }
        }
    }

    fn structure_lines(&self, depth: usize, out: &mut String) {
        for item in &self.items {
            match item {
                FuncItem::Pass(p) => {
                    out.push_str(&format!("{}{}\n", "  ".repeat(depth), p.name()));
                }
                FuncItem::Batch(b) => {
                    out.push_str(&format!("{}BasicBlock Pass Manager\n", "  ".repeat(depth)));
                    for p in &b.passes {
                        out.push_str(&format!("{}{}\n", "  ".repeat(depth + 1), p.name()));
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// module-level manager
// ---------------------------------------------------------------------------

enum ModuleItem {
    Pass(Box<dyn ModulePass>),
    Batch(FunctionPassManager),
}

/// The top-level scheduler a driver owns.
pub struct PassManager {
    registry: Rc<PassRegistry>,
    settings: Settings,
    items: Vec<ModuleItem>,
    available: HashMap<AnalysisId, usize>,
    last_use: HashMap<usize, usize>,
    timing: TimingInfo,
}

impl PassManager {
    pub fn new(registry: Rc<PassRegistry>, settings: Settings) -> Self {
        Self {
            registry,
            settings,
            items: Vec::new(),
            available: HashMap::new(),
            last_use: HashMap::new(),
            timing: TimingInfo::default(),
        }
    }

    /// Add a pass by its registered argument string.
    pub fn add_by_argument(&mut self, argument: &str) -> Result<()> {
        let pass = self
            .registry
            .clone()
            .create(argument)
            .ok_or_else(|| Error::Unresolved(format!("no pass registered as `{argument}`")))?;
        self.add(pass)
    }

    /// Add a pass of any granularity; finer passes batch automatically.
    pub fn add(&mut self, pass: AnyPass) -> Result<()> {
        if self.settings.pass_debug >= PassDebugLevel::Arguments {
            debug!("scheduling pass `{}`", pass.name());
        }
        match pass {
            AnyPass::Module(p) => {
                let usage = p.usage();
                self.satisfy_requirements(&usage)?;
                // A module item closes any open batch by itself.
                let index = self.items.len();
                self.mark_last_uses(&usage, index);
                self.items.push(ModuleItem::Pass(p));
                self.apply_to_availability(&usage, index);
                Ok(())
            }
            AnyPass::Function(p) => {
                let usage = p.usage();
                self.satisfy_requirements(&usage)?;
                let index = self.ensure_batch();
                self.mark_last_uses(&usage, index);
                let ModuleItem::Batch(batch) = &mut self.items[index] else {
                    unreachable!("ensure_batch returns a batch index");
                };
                batch.add(AnyPass::Function(p))?;
                self.apply_to_availability(&usage, index);
                // An analysis provided by a non-analysis pass pins the
                // schedule: nothing may batch-reorder across it.
                let is_pure_analysis = usage
                    .provided
                    .iter()
                    .all(|id| self.registry.is_analysis(id))
                    && usage.preserved.preserves_all();
                if !usage.provided.is_empty() && !is_pure_analysis {
                    self.close_batch();
                }
                Ok(())
            }
            AnyPass::Block(p) => {
                let usage = p.usage();
                self.satisfy_requirements(&usage)?;
                let index = self.ensure_batch();
                self.mark_last_uses(&usage, index);
                let ModuleItem::Batch(batch) = &mut self.items[index] else {
                    unreachable!("ensure_batch returns a batch index");
                };
                batch.add(AnyPass::Block(p))?;
                self.apply_to_availability(&usage, index);
                Ok(())
            }
        }
    }

    fn ensure_batch(&mut self) -> usize {
        match self.items.last() {
            Some(ModuleItem::Batch(_)) => self.items.len() - 1,
            _ => {
                self.items
                    .push(ModuleItem::Batch(FunctionPassManager::new(
                        self.registry.clone(),
                    )));
                self.items.len() - 1
            }
        }
    }

    fn close_batch(&mut self) {
        // Batches are closed implicitly by pushing the next module item;
        // an explicit marker forces later function passes into a new one.
        if let Some(ModuleItem::Batch(_)) = self.items.last() {
            self.items.push(ModuleItem::Pass(Box::new(BatchFence)));
        }
    }

    fn satisfy_requirements(&mut self, usage: &AnalysisUsage) -> Result<()> {
        for &r in &usage.required {
            if self.available.contains_key(r) {
                continue;
            }
            let synthesized = self.registry.clone().create(r).ok_or_else(|| {
                Error::Unresolved(format!("required analysis `{r}` is not registered"))
            })?;
            self.add(synthesized)?;
        }
        Ok(())
    }

    fn mark_last_uses(&mut self, usage: &AnalysisUsage, consumer: usize) {
        for &r in &usage.required {
            if let Some(&provider) = self.available.get(r) {
                self.last_use.insert(provider, consumer);
            }
        }
    }

    fn apply_to_availability(&mut self, usage: &AnalysisUsage, index: usize) {
        let registry = self.registry.clone();
        self.available
            .retain(|&id, _| usage.preserved.covers(id, registry.is_cfg_only(id)));
        for &p in &usage.provided {
            self.available.insert(p, index);
        }
    }

    /// Run every scheduled pass over the module.
    pub fn run(&mut self, module: &mut Module, cx: &Context) -> Result<bool> {
        if self.settings.pass_debug >= PassDebugLevel::Structure {
            debug!("{}", self.dump_structure());
        }
        let mut am = AnalysisCache::new();
        let mut changed = false;
        let registry = self.registry.clone();
        let settings = self.settings.clone();
        let mut timing = TimingInfo::default();

        let mut last_user_of: HashMap<usize, Vec<usize>> = HashMap::new();
        for (&provider, &consumer) in &self.last_use {
            last_user_of.entry(consumer).or_default().push(provider);
        }

        for index in 0..self.items.len() {
            let (name, usage) = match &self.items[index] {
                ModuleItem::Pass(p) => (p.name(), p.usage()),
                ModuleItem::Batch(b) => ("Function Pass Manager", b.merged_usage()),
            };
            for &r in &usage.required {
                if !am.contains(r) {
                    return Err(Error::Unresolved(format!(
                        "analysis `{r}` used but not available"
                    )));
                }
            }
            debug_pass(&settings, "run", name, &usage);
            let started = Instant::now();
            let this_changed = match &mut self.items[index] {
                ModuleItem::Pass(p) => {
                    let r = p.run(module, cx, &mut am)?;
                    timing.record(p.name(), started.elapsed());
                    r
                }
                ModuleItem::Batch(b) => b.run(module, cx, &settings, &mut am, &mut timing)?,
            };
            if this_changed && log_enabled!(Level::Debug) {
                debug!("pass `{name}` modified module `{}`", module.name);
            }
            changed |= this_changed;
            am.invalidate(&usage.preserved, &registry);
            if settings.verify_each {
                verifier::verify_module(module, cx)?;
            }
            if let Some(providers) = last_user_of.get(&index) {
                for &provider in providers {
                    self.release_item(provider, &mut am);
                }
            }
        }
        if settings.time_passes {
            debug!("{}", timing.report());
        }
        self.timing.absorb(timing);
        Ok(changed)
    }

    fn release_item(&mut self, index: usize, am: &mut AnalysisCache) {
        let provided = match &self.items[index] {
            ModuleItem::Pass(p) => p.usage().provided,
            ModuleItem::Batch(b) => b.merged_usage().provided,
        };
        for id in provided {
            am.remove(id);
        }
        match &mut self.items[index] {
            ModuleItem::Pass(p) => {
                debug!("freeing pass `{}`", p.name());
                p.release_memory();
            }
            ModuleItem::Batch(b) => {
                for item in &mut b.items {
                    match item {
                        FuncItem::Pass(p) => p.release_memory(),
                        FuncItem::Batch(bb) => {
                            for p in &mut bb.passes {
                                p.release_memory();
                            }
                        }
                    }
                }
            }
        }
    }

    /// Accumulated timing across `run` calls (`-time-passes` surface).
    pub fn timing(&self) -> &TimingInfo {
        &self.timing
    }

    /// The manager nesting, for `-debug-pass=Structure`-style output.
    pub fn dump_structure(&self) -> String {
        let mut out = String::from("Module Pass Manager\n");
        for item in &self.items {
            match item {
                ModuleItem::Pass(p) => out.push_str(&format!("  {}\n", p.name())),
                ModuleItem::Batch(b) => {
                    out.push_str("  Function Pass Manager\n");
                    b.structure_lines(2, &mut out);
                }
            }
        }
        out
    }
}

/// Zero-cost marker closing a function batch so later function passes
/// open a fresh one.
struct BatchFence;

impl ModulePass for BatchFence {
    fn name(&self) -> &'static str {
        "<batch boundary>"
    }

    fn usage(&self) -> AnalysisUsage {
        AnalysisUsage::new().preserves(Preserved::All)
    }

    fn run(&mut self, _: &mut Module, _: &Context, _: &mut AnalysisCache) -> Result<bool> {
        Ok(false)
    }
}

fn debug_pass(settings: &Settings, action: &str, name: &str, usage: &AnalysisUsage) {
    if settings.pass_debug >= PassDebugLevel::Executions && log_enabled!(Level::Debug) {
        debug!("{action} `{name}`");
        if settings.pass_debug >= PassDebugLevel::Details {
            debug!(
                "  required: {:?}  provided: {:?}  preserved: {:?}",
                usage.required, usage.provided, usage.preserved
            );
        }
    }
}
