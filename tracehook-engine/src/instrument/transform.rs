// Method rewriting
//
// Splices a guarded call to the capture hook at the end of each source line
// that carries tracepoints. The line's own code runs unmodified inside a
// try range; the hook runs when control leaves the line normally (fall
// through, return, or a jump out of the line) and from a catch-all handler
// that re-throws the original exception.

use super::analysis::recompute;
use super::descriptor::{parse_field_descriptor, parse_method_descriptor, FieldType};
use super::ir::{
    ClassIr, Insn, InvokeKind, Kind, Label, MethodIr, TryCatchBlock, THROWABLE_CLASS,
};
use super::HookTarget;
use crate::error::{EngineError, EngineResult};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, trace};

/// Tracepoint ids to install, keyed by source line
pub type LineTargets = BTreeMap<u32, Vec<String>>;

const MAP_CLASS: &str = "java/util/HashMap";
const STRING_ELEMENT: &str = "Ljava/lang/String;";

#[derive(Debug, Clone, PartialEq, Eq)]
struct CapturedLocal {
    name: String,
    slot: u16,
    ty: FieldType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Boundary {
    Fallthrough,
    Return(Option<Kind>),
    Throw,
}

/// A line span to guard: code[start..end], hook spliced before code[end]
#[derive(Debug, Clone)]
struct Region {
    line: u32,
    ids: Vec<String>,
    start_label: Label,
    /// The start label does not exist yet and is emitted before code[start]
    fresh_start: bool,
    start: usize,
    end: usize,
    boundary: Boundary,
}

#[derive(Debug, Clone)]
struct OpenRegion {
    line: u32,
    ids: Vec<String>,
    start_label: Label,
    fresh_start: bool,
    start: usize,
}

impl OpenRegion {
    fn close(self, end: usize, boundary: Boundary) -> Region {
        Region {
            line: self.line,
            ids: self.ids,
            start_label: self.start_label,
            fresh_start: self.fresh_start,
            start: self.start,
            end,
            boundary,
        }
    }
}

struct LabelAllocator {
    next: u32,
}

impl LabelAllocator {
    fn new(method: &MethodIr) -> Self {
        Self {
            next: method.fresh_label().0,
        }
    }

    fn next(&mut self) -> Label {
        let label = Label(self.next);
        self.next += 1;
        label
    }
}

/// Finds the spans to guard in one method
struct Planner<'a> {
    targets: &'a LineTargets,
    regions: Vec<Region>,
    open: Option<OpenRegion>,
    installed: HashSet<u32>,
    /// Constructor has not yet called its super or this constructor
    pending_init: bool,
    /// Objects created but not yet initialized while `pending_init`
    new_depth: usize,
    deferred: Option<(u32, Vec<String>)>,
}

impl<'a> Planner<'a> {
    fn plan(method: &MethodIr, targets: &'a LineTargets, labels: &mut LabelAllocator) -> Vec<Region> {
        let mut planner = Planner {
            targets,
            regions: Vec::new(),
            open: None,
            installed: HashSet::new(),
            pending_init: method.is_constructor(),
            new_depth: 0,
            deferred: None,
        };

        let code = &method.code;
        let mut index = 0;
        while index < code.len() {
            match &code[index] {
                Insn::Label { label } => {
                    if let Some(Insn::Line { line }) = code.get(index + 1) {
                        planner.close_at_line(code, index);
                        planner.start_line(*line, Some(*label), index + 2, labels);
                        index += 2;
                        continue;
                    }
                }
                Insn::Line { line } => {
                    planner.close_at_line(code, index);
                    planner.start_line(*line, None, index + 1, labels);
                }
                Insn::Return { kind } => planner.close(index, Boundary::Return(*kind)),
                Insn::Throw => planner.close(index, Boundary::Throw),
                Insn::New { .. } if planner.pending_init => planner.new_depth += 1,
                Insn::Invoke {
                    kind: InvokeKind::Special,
                    method: target,
                } if planner.pending_init && target.is_constructor() => {
                    if planner.new_depth > 0 {
                        planner.new_depth -= 1;
                    } else {
                        planner.pending_init = false;
                        if let Some((line, ids)) = planner.deferred.take() {
                            trace!(line, "opening deferred constructor region");
                            planner.open = Some(OpenRegion {
                                line,
                                ids,
                                start_label: labels.next(),
                                fresh_start: true,
                                start: index + 1,
                            });
                        }
                    }
                }
                _ => {}
            }
            index += 1;
        }

        if let Some(open) = planner.open.take() {
            debug!(line = open.line, "line span reaches the end of the method, not guarded");
        }
        planner.regions
    }

    fn close(&mut self, end: usize, boundary: Boundary) {
        if let Some(open) = self.open.take() {
            self.regions.push(open.close(end, boundary));
        }
    }

    /// Close before the run of labels leading into the next line, so jumps
    /// to any of those labels stay outside the span
    fn close_at_line(&mut self, code: &[Insn], mut end: usize) {
        if let Some(open) = &self.open {
            while end > open.start && matches!(code[end - 1], Insn::Label { .. }) {
                end -= 1;
            }
        }
        self.close(end, Boundary::Fallthrough);
    }

    fn start_line(&mut self, line: u32, existing: Option<Label>, start: usize, labels: &mut LabelAllocator) {
        let Some(ids) = self.targets.get(&line) else {
            return;
        };
        if ids.is_empty() || self.installed.contains(&line) {
            return;
        }

        if self.pending_init {
            if self.deferred.is_none() {
                self.installed.insert(line);
                self.deferred = Some((line, ids.clone()));
            }
            return;
        }

        self.installed.insert(line);
        self.open = Some(OpenRegion {
            line,
            ids: ids.clone(),
            start_label: existing.unwrap_or_else(|| labels.next()),
            fresh_start: existing.is_none(),
            start,
        });
    }
}

/// Rewrites one method given its planned regions
struct Splicer<'a> {
    class: &'a ClassIr,
    method: &'a MethodIr,
    file: &'a str,
    hook: &'a HookTarget,
    positions: HashMap<Label, usize>,
    exc_slot: u16,
    ret_slot: u16,
}

impl Splicer<'_> {
    /// Locals visible at instruction index `pos` of the original code.
    /// A variable whose scope opens at a label directly at `pos` counts as
    /// seen: falling through into that label means its store already ran.
    fn live_at(&self, pos: usize) -> EngineResult<Vec<CapturedLocal>> {
        let code = &self.method.code;
        let mut seen_until = pos;
        while matches!(code.get(seen_until), Some(Insn::Label { .. }) | Some(Insn::Line { .. })) {
            seen_until += 1;
        }
        let mut live: BTreeMap<u16, CapturedLocal> = BTreeMap::new();

        if self.method.local_variables.is_empty() {
            let descriptor = parse_method_descriptor(&self.method.descriptor)?;
            let mut slot = if self.method.is_static() { 0 } else { 1 };
            for (index, param) in descriptor.params.into_iter().enumerate() {
                let size = param.size();
                live.insert(
                    slot,
                    CapturedLocal {
                        name: format!("arg{}", index),
                        slot,
                        ty: param,
                    },
                );
                slot += size;
            }
        } else {
            for variable in &self.method.local_variables {
                let (Some(start), Some(end)) = (
                    self.positions.get(&variable.start),
                    self.positions.get(&variable.end),
                ) else {
                    return Err(EngineError::rewrite(
                        &self.class.name,
                        &self.method.name,
                        format!("local variable {} refers to an undefined label", variable.name),
                    ));
                };
                if *start < seen_until && *end >= pos {
                    live.insert(
                        variable.slot,
                        CapturedLocal {
                            name: variable.name.clone(),
                            slot: variable.slot,
                            ty: parse_field_descriptor(&variable.descriptor)?,
                        },
                    );
                }
            }
        }

        if !self.method.is_static() {
            live.entry(0).or_insert_with(|| CapturedLocal {
                name: "this".to_string(),
                slot: 0,
                ty: FieldType::Object(self.class.name.clone()),
            });
        }

        Ok(live.into_values().collect())
    }

    fn hook_call(&self, ids: &[String], line: u32, locals: &[CapturedLocal]) -> Vec<Insn> {
        let mut code = vec![
            Insn::int(ids.len() as i32),
            Insn::NewArray {
                element: STRING_ELEMENT.to_string(),
            },
        ];
        for (index, id) in ids.iter().enumerate() {
            code.push(Insn::Dup);
            code.push(Insn::int(index as i32));
            code.push(Insn::string(id.as_str()));
            code.push(Insn::ArrayStore { kind: Kind::Ref });
        }

        code.push(Insn::string(self.file));
        code.push(Insn::int(line as i32));

        code.push(Insn::New {
            class: MAP_CLASS.to_string(),
        });
        code.push(Insn::Dup);
        code.push(Insn::invoke(InvokeKind::Special, MAP_CLASS, "<init>", "()V"));
        for local in locals {
            code.push(Insn::Dup);
            code.push(Insn::string(local.name.as_str()));
            code.push(Insn::load(local.ty.kind(), local.slot));
            if let Some((owner, descriptor)) = local.ty.boxing() {
                code.push(Insn::invoke(InvokeKind::Static, owner, "valueOf", descriptor));
            }
            code.push(Insn::invoke(
                InvokeKind::Virtual,
                MAP_CLASS,
                "put",
                "(Ljava/lang/Object;Ljava/lang/Object;)Ljava/lang/Object;",
            ));
            code.push(Insn::Pop);
        }

        code.push(Insn::invoke(
            InvokeKind::Static,
            &self.hook.owner,
            &self.hook.name,
            &self.hook.descriptor,
        ));
        code
    }

    /// Whether control can fall through into position `pos`
    fn reachable_by_fallthrough(&self, pos: usize) -> bool {
        self.method.code[..pos]
            .iter()
            .rev()
            .find(|insn| !matches!(insn, Insn::Label { .. } | Insn::Line { .. }))
            .map(|insn| !insn.ends_flow())
            .unwrap_or(true)
    }

    fn has_code(&self, start: usize, end: usize) -> bool {
        self.method.code[start..end]
            .iter()
            .any(|insn| !matches!(insn, Insn::Label { .. } | Insn::Line { .. }))
    }

    fn splice(&self, regions: &[Region], labels: &mut LabelAllocator) -> EngineResult<(MethodIr, usize)> {
        let code = &self.method.code;
        let mut starts: HashMap<usize, &Region> = HashMap::new();
        let mut ends: HashMap<usize, (&Region, Label)> = HashMap::new();
        let mut exits: HashMap<usize, Label> = HashMap::new();
        let mut tail = Vec::new();
        let mut blocks = Vec::new();
        let mut insertions = 0;

        for region in regions {
            let mut hooked = false;
            if region.fresh_start {
                starts.insert(region.start, region);
            }
            let end_label = labels.next();
            ends.insert(region.end, (region, end_label));

            // jumps leaving the span go through a trampoline that runs the hook
            for index in region.start..region.end {
                let Some(target) = code[index].jump_target() else {
                    continue;
                };
                let target_pos = self.positions.get(&target).copied().ok_or_else(|| {
                    EngineError::rewrite(
                        &self.class.name,
                        &self.method.name,
                        format!("jump to undefined label {}", target),
                    )
                })?;
                if (region.start..region.end).contains(&target_pos) {
                    continue;
                }
                let trampoline = labels.next();
                exits.insert(index, trampoline);
                tail.push(Insn::label(trampoline));
                tail.extend(self.hook_call(&region.ids, region.line, &self.live_at(index)?));
                tail.push(Insn::Goto { target });
                hooked = true;
            }

            if self.has_code(region.start, region.end) {
                let start_live = self.live_at(region.start)?;
                let end_live = self.live_at(region.end)?;
                let guarded: Vec<CapturedLocal> =
                    start_live.into_iter().filter(|l| end_live.contains(l)).collect();

                let handler = labels.next();
                tail.push(Insn::label(handler));
                tail.push(Insn::store(Kind::Ref, self.exc_slot));
                tail.extend(self.hook_call(&region.ids, region.line, &guarded));
                tail.push(Insn::load(Kind::Ref, self.exc_slot));
                tail.push(Insn::Throw);
                blocks.push(TryCatchBlock {
                    start: region.start_label,
                    end: end_label,
                    handler,
                    catch_type: Some(THROWABLE_CLASS.to_string()),
                });
                hooked = true;
            }

            if region.boundary != Boundary::Fallthrough || self.reachable_by_fallthrough(region.end) {
                hooked = true;
            }
            if hooked {
                insertions += 1;
            }
        }

        let mut out = Vec::with_capacity(code.len() + tail.len() + regions.len() * 16);
        for (index, insn) in code.iter().enumerate() {
            if let Some((region, end_label)) = ends.get(&index) {
                out.push(Insn::label(*end_label));
                let live = self.live_at(index)?;
                match region.boundary {
                    Boundary::Fallthrough => {
                        if self.reachable_by_fallthrough(index) {
                            out.extend(self.hook_call(&region.ids, region.line, &live));
                        }
                    }
                    Boundary::Return(Some(kind)) => {
                        out.push(Insn::store(kind, self.ret_slot));
                        out.extend(self.hook_call(&region.ids, region.line, &live));
                        out.push(Insn::load(kind, self.ret_slot));
                    }
                    Boundary::Return(None) | Boundary::Throw => {
                        out.extend(self.hook_call(&region.ids, region.line, &live));
                    }
                }
            }
            if let Some(region) = starts.get(&index) {
                out.push(Insn::label(region.start_label));
            }

            let mut insn = insn.clone();
            if let (Some(trampoline), Some(target)) = (exits.get(&index), insn.jump_target_mut()) {
                *target = *trampoline;
            }
            out.push(insn);
        }
        out.extend(tail);

        let mut rewritten = self.method.clone();
        rewritten.code = out;
        rewritten.try_catch = order_blocks(&rewritten, blocks);
        Ok((rewritten, insertions))
    }
}

/// Place each new block before the first existing block that is not nested
/// inside it, so inner handlers keep priority over outer ones
fn order_blocks(method: &MethodIr, new_blocks: Vec<TryCatchBlock>) -> Vec<TryCatchBlock> {
    let positions = method.label_positions();
    let span = |block: &TryCatchBlock| {
        (
            positions.get(&block.start).copied().unwrap_or(0),
            positions.get(&block.end).copied().unwrap_or(usize::MAX),
        )
    };

    let mut ordered = method.try_catch.clone();
    for block in new_blocks {
        let (start, end) = span(&block);
        let at = ordered
            .iter()
            .position(|existing| {
                let (s, e) = span(existing);
                !(s >= start && e <= end)
            })
            .unwrap_or(ordered.len());
        ordered.insert(at, block);
    }
    ordered
}

fn scratch_base(method: &MethodIr) -> EngineResult<u16> {
    let descriptor = parse_method_descriptor(&method.descriptor)?;
    let entry = descriptor.params_size() + if method.is_static() { 0 } else { 1 };
    let used = method
        .code
        .iter()
        .filter_map(|insn| match insn {
            Insn::Load { kind, slot } | Insn::Store { kind, slot } => Some(slot + kind.size()),
            Insn::Iinc { slot, .. } => Some(slot + 1),
            _ => None,
        })
        .max()
        .unwrap_or(0);
    let declared = method
        .local_variables
        .iter()
        .map(|v| v.slot + Kind::of_descriptor(&v.descriptor).size())
        .max()
        .unwrap_or(0);
    Ok(method.max_locals.max(entry).max(used).max(declared))
}

/// Rewrite one method; None when nothing was inserted
pub fn instrument_method(
    class: &ClassIr,
    method: &MethodIr,
    file: &str,
    targets: &LineTargets,
    hook: &HookTarget,
) -> EngineResult<Option<MethodIr>> {
    if !method.has_code() {
        return Ok(None);
    }

    let mut labels = LabelAllocator::new(method);
    let regions = Planner::plan(method, targets, &mut labels);
    if regions.is_empty() {
        return Ok(None);
    }

    let base = scratch_base(method)?;
    let splicer = Splicer {
        class,
        method,
        file,
        hook,
        positions: method.label_positions(),
        exc_slot: base,
        ret_slot: base + 1,
    };
    let (mut rewritten, insertions) = splicer.splice(&regions, &mut labels)?;
    if insertions == 0 {
        return Ok(None);
    }

    recompute(class, &mut rewritten)?;
    debug!(
        class = %class.name,
        method = %method.name,
        insertions,
        "method instrumented"
    );
    Ok(Some(rewritten))
}

/// Rewrite every method of a class; None when no method changed
pub fn instrument_class(class: &ClassIr, targets: &LineTargets, hook: &HookTarget) -> EngineResult<Option<ClassIr>> {
    let Some(file) = class.source_file.as_deref() else {
        return Err(EngineError::MissingSourceFile(class.name.clone()));
    };

    let mut rewritten = class.clone();
    let mut changed = false;
    for (index, method) in class.methods.iter().enumerate() {
        if let Some(method) = instrument_method(class, method, file, targets, hook)? {
            rewritten.methods[index] = method;
            changed = true;
        }
    }

    Ok(changed.then_some(rewritten))
}
