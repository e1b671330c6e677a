//! Single-pass AST-to-bytecode compiler.
//!
//! Locals live at the bottom of each call frame and are resolved to slots at
//! compile time; free variables become upvalues captured Lox-style. Jump
//! targets are back-patched. Every emitted byte carries a source line in the
//! run-length table so runtime faults resolve to script lines.

use crate::ast::{AssignTarget, BinOp, Expr, Stmt, TableItem, UnOp};
use crate::error::CompileError;
use crate::opcode::{OpCode, MULTI};
use crate::parser;
use crate::proto::{CallInfo, Constant, FunctionProto, LocalInfo};

pub fn compile(source: &str, source_name: &str) -> Result<FunctionProto, CompileError> {
    let block = parser::parse(source)?;
    let mut compiler = Compiler {
        source_name: source_name.to_string(),
        funcs: vec![FuncState::new(source_name, 0, 0, 0)],
    };
    compiler.block(&block)?;
    let last_line = block.last().map(stmt_line).unwrap_or(0);
    let (proto, _) = compiler.finish_function(last_line)?;
    Ok(proto)
}

const MAX_LOCALS: usize = 255;
const MAX_UPVALUES: usize = 255;
const MAX_ARGS: usize = 254;

struct Local {
    name: String,
    depth: usize,
    captured: bool,
    dbg_index: usize,
}

struct UpvalueDesc {
    is_local: bool,
    index: u8,
}

struct LoopCtx {
    scope_depth: usize,
    break_jumps: Vec<usize>,
}

struct FuncState {
    proto: FunctionProto,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: usize,
    loops: Vec<LoopCtx>,
    max_slots: usize,
}

impl FuncState {
    fn new(source_name: &str, num_params: u8, line: u32, last_line: u32) -> Self {
        FuncState {
            proto: FunctionProto {
                source_name: source_name.to_string(),
                line_defined: line,
                last_line_defined: last_line,
                num_upvalues: 0,
                num_params,
                is_vararg: false,
                num_registers: 0,
                code: Vec::new(),
                constants: Vec::new(),
                protos: Vec::new(),
                lines: Vec::new(),
                locals: Vec::new(),
                calls: Vec::new(),
                upvalue_names: Vec::new(),
            },
            locals: Vec::new(),
            upvalues: Vec::new(),
            scope_depth: 0,
            loops: Vec::new(),
            max_slots: 0,
        }
    }

    fn emit_byte(&mut self, byte: u8, line: u32) {
        self.proto.code.push(byte);
        if let Some(last) = self.proto.lines.last_mut() {
            if last.0 == line {
                last.1 += 1;
                return;
            }
        }
        self.proto.lines.push((line, 1));
    }

    fn emit_op(&mut self, op: OpCode, line: u32) {
        self.emit_byte(op as u8, line);
    }

    fn emit_u16(&mut self, value: u16, line: u32) {
        self.emit_byte((value & 0xFF) as u8, line);
        self.emit_byte((value >> 8) as u8, line);
    }

    fn add_constant(&mut self, value: Constant, line: u32) -> Result<u16, CompileError> {
        for (i, existing) in self.proto.constants.iter().enumerate() {
            if constants_identical(existing, &value) {
                return Ok(i as u16);
            }
        }
        let index = self.proto.constants.len();
        if index > u16::MAX as usize {
            return Err(CompileError::compile(line, "too many constants in one chunk"));
        }
        self.proto.constants.push(value);
        Ok(index as u16)
    }

    fn current_offset(&self) -> usize {
        self.proto.code.len()
    }

    /// Emits `op` with a placeholder offset; returns the patch position.
    fn emit_jump(&mut self, op: OpCode, line: u32) -> usize {
        self.emit_op(op, line);
        let at = self.proto.code.len();
        self.emit_byte(0, line);
        self.emit_byte(0, line);
        at
    }

    fn patch_jump(&mut self, at: usize, line: u32) -> Result<(), CompileError> {
        let target = self.proto.code.len();
        let offset = target as isize - at as isize - 2;
        let offset = i16::try_from(offset)
            .map_err(|_| CompileError::compile(line, "jump distance too large"))?;
        let bytes = offset.to_le_bytes();
        self.proto.code[at] = bytes[0];
        self.proto.code[at + 1] = bytes[1];
        Ok(())
    }

    fn emit_loop(&mut self, loop_start: usize, line: u32) -> Result<(), CompileError> {
        self.emit_op(OpCode::Loop, line);
        let at = self.proto.code.len();
        let offset = loop_start as isize - at as isize - 2;
        let offset = i16::try_from(offset)
            .map_err(|_| CompileError::compile(line, "loop body too large"))?;
        let bytes = offset.to_le_bytes();
        self.emit_byte(bytes[0], line);
        self.emit_byte(bytes[1], line);
        Ok(())
    }
}

struct Compiler {
    source_name: String,
    funcs: Vec<FuncState>,
}

impl Compiler {
    fn fs(&mut self) -> &mut FuncState {
        self.funcs.last_mut().expect("function stack is never empty")
    }

    fn finish_function(
        &mut self,
        last_line: u32,
    ) -> Result<(FunctionProto, Vec<UpvalueDesc>), CompileError> {
        let fs = self.fs();
        fs.emit_op(OpCode::Return, last_line);
        fs.emit_byte(0, last_line);
        let end_pc = fs.proto.code.len() as u32;
        for local in &fs.locals {
            fs.proto.locals[local.dbg_index].end_pc = end_pc;
        }
        let mut state = self.funcs.pop().expect("function stack is never empty");
        state.proto.num_upvalues = state.upvalues.len() as u8;
        state.proto.num_registers = state.max_slots.min(MAX_LOCALS) as u8;
        Ok((state.proto, state.upvalues))
    }

    fn declare_local(&mut self, name: &str, line: u32) -> Result<u8, CompileError> {
        let fs = self.fs();
        if fs.locals.len() >= MAX_LOCALS {
            return Err(CompileError::compile(
                line,
                "too many local variables in one function",
            ));
        }
        let slot = fs.locals.len() as u8;
        let dbg_index = fs.proto.locals.len();
        let start_pc = fs.proto.code.len() as u32;
        fs.proto.locals.push(LocalInfo {
            name: name.to_string(),
            start_pc,
            end_pc: 0,
        });
        let depth = fs.scope_depth;
        fs.locals.push(Local {
            name: name.to_string(),
            depth,
            captured: false,
            dbg_index,
        });
        fs.max_slots = fs.max_slots.max(fs.locals.len());
        Ok(slot)
    }

    fn begin_scope(&mut self) {
        self.fs().scope_depth += 1;
    }

    fn end_scope(&mut self, line: u32) {
        let fs = self.fs();
        fs.scope_depth -= 1;
        let depth = fs.scope_depth;
        while let Some(local) = fs.locals.last() {
            if local.depth <= depth {
                break;
            }
            let end_pc = fs.proto.code.len() as u32;
            let local = fs.locals.pop().expect("checked non-empty");
            fs.proto.locals[local.dbg_index].end_pc = end_pc;
            if local.captured {
                fs.emit_op(OpCode::CloseUpvalue, line);
            } else {
                fs.emit_op(OpCode::Pop, line);
            }
        }
    }

    fn resolve_local(&self, level: usize, name: &str) -> Option<u8> {
        self.funcs[level]
            .locals
            .iter()
            .rposition(|l| l.name == name)
            .map(|i| i as u8)
    }

    fn resolve_upvalue(&mut self, level: usize, name: &str, line: u32) -> Result<Option<u8>, CompileError> {
        if level == 0 {
            return Ok(None);
        }
        if let Some(slot) = self.resolve_local(level - 1, name) {
            self.funcs[level - 1].locals[slot as usize].captured = true;
            return self.add_upvalue(level, true, slot, name, line).map(Some);
        }
        if let Some(up) = self.resolve_upvalue(level - 1, name, line)? {
            return self.add_upvalue(level, false, up, name, line).map(Some);
        }
        Ok(None)
    }

    fn add_upvalue(
        &mut self,
        level: usize,
        is_local: bool,
        index: u8,
        name: &str,
        line: u32,
    ) -> Result<u8, CompileError> {
        let fs = &mut self.funcs[level];
        for (i, up) in fs.upvalues.iter().enumerate() {
            if up.is_local == is_local && up.index == index {
                return Ok(i as u8);
            }
        }
        if fs.upvalues.len() >= MAX_UPVALUES {
            return Err(CompileError::compile(line, "too many captured variables"));
        }
        fs.upvalues.push(UpvalueDesc { is_local, index });
        fs.proto.upvalue_names.push(name.to_string());
        Ok((fs.upvalues.len() - 1) as u8)
    }

    fn string_constant(&mut self, value: &str, line: u32) -> Result<u16, CompileError> {
        self.fs().add_constant(Constant::Str(value.to_string()), line)
    }

    fn block(&mut self, stmts: &[Stmt]) -> Result<(), CompileError> {
        for stmt in stmts {
            self.statement(stmt)?;
        }
        Ok(())
    }

    fn statement(&mut self, stmt: &Stmt) -> Result<(), CompileError> {
        match stmt {
            Stmt::Local { name, init, line } => {
                match init {
                    Some(expr) => self.expression(expr)?,
                    None => self.fs().emit_op(OpCode::Nil, *line),
                }
                self.declare_local(name, *line)?;
                Ok(())
            }
            Stmt::Assign {
                target,
                value,
                line,
            } => self.assignment(target, value, *line),
            Stmt::ExprStat { expr, line } => {
                // Statement position: every result is discarded.
                match expr {
                    Expr::Call { callee, args, .. } => self.call(callee, args, 0, *line),
                    Expr::MethodCall {
                        recv, name, args, ..
                    } => self.method_call(recv, name, args, 0, *line),
                    _ => Err(CompileError::compile(*line, "expression is not a statement")),
                }
            }
            Stmt::If {
                arms,
                else_body,
                line,
            } => self.if_statement(arms, else_body.as_deref(), *line),
            Stmt::While { cond, body, line } => self.while_statement(cond, body, *line),
            Stmt::NumericFor {
                var,
                start,
                limit,
                step,
                body,
                line,
            } => self.for_statement(var, start, limit, step.as_ref(), body, *line),
            Stmt::Return { exprs, line } => self.return_statement(exprs, *line),
            Stmt::Break { line } => self.break_statement(*line),
            Stmt::Function {
                target,
                params,
                body,
                line,
                last_line,
            } => {
                let name = target_debug_name(target);
                match target {
                    AssignTarget::Name(global) => {
                        self.function_value(&name, params, body, *line, *last_line)?;
                        self.assign_name(global, *line)
                    }
                    AssignTarget::Index { obj, index } => {
                        let value = Expr::Function {
                            params: params.clone(),
                            body: body.clone(),
                            line: *line,
                            last_line: *last_line,
                        };
                        self.assignment(
                            &AssignTarget::Index {
                                obj: obj.clone(),
                                index: index.clone(),
                            },
                            &value,
                            *line,
                        )
                    }
                }
            }
            Stmt::LocalFunction {
                name,
                params,
                body,
                line,
                last_line,
            } => {
                // Declare first so the body can call itself recursively; the
                // closure pushed next becomes the slot's value.
                self.declare_local(name, *line)?;
                self.function_value(name, params, body, *line, *last_line)
            }
        }
    }

    fn assignment(
        &mut self,
        target: &AssignTarget,
        value: &Expr,
        line: u32,
    ) -> Result<(), CompileError> {
        match target {
            AssignTarget::Name(name) => {
                self.expression(value)?;
                self.assign_name(name, line)
            }
            AssignTarget::Index { obj, index } => {
                self.expression(obj)?;
                if let Expr::Str { value: field, .. } = index {
                    self.expression(value)?;
                    let idx = self.string_constant(field, line)?;
                    self.fs().emit_op(OpCode::SetField, line);
                    self.fs().emit_u16(idx, line);
                } else {
                    self.expression(index)?;
                    self.expression(value)?;
                    self.fs().emit_op(OpCode::SetIndex, line);
                }
                Ok(())
            }
        }
    }

    /// Stores the value on top of the stack into `name` and pops it.
    fn assign_name(&mut self, name: &str, line: u32) -> Result<(), CompileError> {
        let level = self.funcs.len() - 1;
        if let Some(slot) = self.resolve_local(level, name) {
            self.fs().emit_op(OpCode::SetLocal, line);
            self.fs().emit_byte(slot, line);
        } else if let Some(up) = self.resolve_upvalue(level, name, line)? {
            self.fs().emit_op(OpCode::SetUpvalue, line);
            self.fs().emit_byte(up, line);
        } else {
            let idx = self.string_constant(name, line)?;
            self.fs().emit_op(OpCode::SetGlobal, line);
            self.fs().emit_u16(idx, line);
        }
        Ok(())
    }

    fn if_statement(
        &mut self,
        arms: &[(Expr, Vec<Stmt>)],
        else_body: Option<&[Stmt]>,
        line: u32,
    ) -> Result<(), CompileError> {
        let mut end_jumps = Vec::new();
        for (cond, body) in arms {
            self.expression(cond)?;
            let skip = self.fs().emit_jump(OpCode::JumpIfFalse, line);
            self.begin_scope();
            self.block(body)?;
            self.end_scope(line);
            end_jumps.push(self.fs().emit_jump(OpCode::Jump, line));
            self.fs().patch_jump(skip, line)?;
        }
        if let Some(body) = else_body {
            self.begin_scope();
            self.block(body)?;
            self.end_scope(line);
        }
        for at in end_jumps {
            self.fs().patch_jump(at, line)?;
        }
        Ok(())
    }

    fn while_statement(
        &mut self,
        cond: &Expr,
        body: &[Stmt],
        line: u32,
    ) -> Result<(), CompileError> {
        let loop_start = self.fs().current_offset();
        self.expression(cond)?;
        let exit = self.fs().emit_jump(OpCode::JumpIfFalse, line);
        let depth = self.fs().scope_depth;
        self.fs().loops.push(LoopCtx {
            scope_depth: depth,
            break_jumps: Vec::new(),
        });
        self.begin_scope();
        self.block(body)?;
        self.end_scope(line);
        self.fs().emit_loop(loop_start, line)?;
        self.fs().patch_jump(exit, line)?;
        let ctx = self.fs().loops.pop().expect("loop context pushed above");
        for at in ctx.break_jumps {
            self.fs().patch_jump(at, line)?;
        }
        Ok(())
    }

    fn for_statement(
        &mut self,
        var: &str,
        start: &Expr,
        limit: &Expr,
        step: Option<&Expr>,
        body: &[Stmt],
        line: u32,
    ) -> Result<(), CompileError> {
        self.begin_scope();
        self.expression(start)?;
        let base = self.declare_local("(for control)", line)?;
        self.expression(limit)?;
        self.declare_local("(for limit)", line)?;
        match step {
            Some(expr) => self.expression(expr)?,
            None => {
                let idx = self.fs().add_constant(Constant::Int(1), line)?;
                self.fs().emit_op(OpCode::Const, line);
                self.fs().emit_u16(idx, line);
            }
        }
        self.declare_local("(for step)", line)?;
        self.fs().emit_op(OpCode::Nil, line);
        self.declare_local(var, line)?;

        self.fs().emit_op(OpCode::ForPrep, line);
        self.fs().emit_byte(base, line);
        let exit = {
            let fs = self.fs();
            let at = fs.proto.code.len();
            fs.emit_byte(0, line);
            fs.emit_byte(0, line);
            at
        };
        let body_start = self.fs().current_offset();
        let depth = self.fs().scope_depth;
        self.fs().loops.push(LoopCtx {
            scope_depth: depth,
            break_jumps: Vec::new(),
        });
        self.begin_scope();
        self.block(body)?;
        self.end_scope(line);
        self.fs().emit_op(OpCode::ForLoop, line);
        self.fs().emit_byte(base, line);
        {
            let fs = self.fs();
            let at = fs.proto.code.len();
            let offset = body_start as isize - at as isize - 2;
            let offset = i16::try_from(offset)
                .map_err(|_| CompileError::compile(line, "loop body too large"))?;
            let bytes = offset.to_le_bytes();
            fs.emit_byte(bytes[0], line);
            fs.emit_byte(bytes[1], line);
        }
        self.fs().patch_jump(exit, line)?;
        let ctx = self.fs().loops.pop().expect("loop context pushed above");
        for at in ctx.break_jumps {
            self.fs().patch_jump(at, line)?;
        }
        self.end_scope(line);
        Ok(())
    }

    fn return_statement(&mut self, exprs: &[Expr], line: u32) -> Result<(), CompileError> {
        if exprs.len() == 1 && exprs[0].is_call() {
            self.call_expression(&exprs[0], MULTI)?;
            self.fs().emit_op(OpCode::Return, line);
            self.fs().emit_byte(MULTI, line);
            return Ok(());
        }
        if exprs.len() > MAX_ARGS {
            return Err(CompileError::compile(line, "too many return values"));
        }
        for expr in exprs {
            self.expression(expr)?;
        }
        self.fs().emit_op(OpCode::Return, line);
        self.fs().emit_byte(exprs.len() as u8, line);
        Ok(())
    }

    fn break_statement(&mut self, line: u32) -> Result<(), CompileError> {
        let fs = self.fs();
        let Some(loop_depth) = fs.loops.last().map(|l| l.scope_depth) else {
            return Err(CompileError::compile(line, "`break` outside a loop"));
        };
        // Unwind locals that belong to scopes inside the loop without
        // forgetting them; the surrounding code paths still need the slots.
        let pops: Vec<bool> = fs
            .locals
            .iter()
            .rev()
            .take_while(|l| l.depth > loop_depth)
            .map(|l| l.captured)
            .collect();
        for captured in pops {
            if captured {
                fs.emit_op(OpCode::CloseUpvalue, line);
            } else {
                fs.emit_op(OpCode::Pop, line);
            }
        }
        let jump = fs.emit_jump(OpCode::Jump, line);
        fs.loops
            .last_mut()
            .expect("checked above")
            .break_jumps
            .push(jump);
        Ok(())
    }

    fn expression(&mut self, expr: &Expr) -> Result<(), CompileError> {
        match expr {
            Expr::Nil { line } => {
                self.fs().emit_op(OpCode::Nil, *line);
                Ok(())
            }
            Expr::True { line } => {
                self.fs().emit_op(OpCode::True, *line);
                Ok(())
            }
            Expr::False { line } => {
                self.fs().emit_op(OpCode::False, *line);
                Ok(())
            }
            Expr::Int { value, line } => self.constant(Constant::Int(*value), *line),
            Expr::Float { value, line } => self.constant(Constant::Float(*value), *line),
            Expr::Str { value, line } => self.constant(Constant::Str(value.clone()), *line),
            Expr::Name { name, line } => {
                let level = self.funcs.len() - 1;
                if let Some(slot) = self.resolve_local(level, name) {
                    self.fs().emit_op(OpCode::GetLocal, *line);
                    self.fs().emit_byte(slot, *line);
                } else if let Some(up) = self.resolve_upvalue(level, name, *line)? {
                    self.fs().emit_op(OpCode::GetUpvalue, *line);
                    self.fs().emit_byte(up, *line);
                } else {
                    let idx = self.string_constant(name, *line)?;
                    self.fs().emit_op(OpCode::GetGlobal, *line);
                    self.fs().emit_u16(idx, *line);
                }
                Ok(())
            }
            Expr::Index { obj, index, line } => {
                self.expression(obj)?;
                if let Expr::Str { value: field, .. } = index.as_ref() {
                    let idx = self.string_constant(field, *line)?;
                    self.fs().emit_op(OpCode::GetField, *line);
                    self.fs().emit_u16(idx, *line);
                } else {
                    self.expression(index)?;
                    self.fs().emit_op(OpCode::GetIndex, *line);
                }
                Ok(())
            }
            Expr::Call { .. } | Expr::MethodCall { .. } => self.call_expression(expr, 1),
            Expr::Function {
                params,
                body,
                line,
                last_line,
            } => self.function_value("<anonymous>", params, body, *line, *last_line),
            Expr::Table { items, line } => self.table_constructor(items, *line),
            Expr::Binary { op, lhs, rhs, line } => {
                self.expression(lhs)?;
                self.expression(rhs)?;
                let opcode = match op {
                    BinOp::Add => OpCode::Add,
                    BinOp::Sub => OpCode::Sub,
                    BinOp::Mul => OpCode::Mul,
                    BinOp::Div => OpCode::Div,
                    BinOp::Mod => OpCode::Mod,
                    BinOp::Pow => OpCode::Pow,
                    BinOp::Concat => OpCode::Concat,
                    BinOp::Eq => OpCode::Eq,
                    BinOp::NotEq => OpCode::NotEq,
                    BinOp::Less => OpCode::Less,
                    BinOp::LessEq => OpCode::LessEq,
                    BinOp::Greater => OpCode::Greater,
                    BinOp::GreaterEq => OpCode::GreaterEq,
                };
                self.fs().emit_op(opcode, *line);
                Ok(())
            }
            Expr::Unary { op, operand, line } => {
                self.expression(operand)?;
                let opcode = match op {
                    UnOp::Neg => OpCode::Neg,
                    UnOp::Not => OpCode::Not,
                    UnOp::Len => OpCode::Len,
                };
                self.fs().emit_op(opcode, *line);
                Ok(())
            }
            Expr::And { lhs, rhs, line } => {
                self.expression(lhs)?;
                let skip = self.fs().emit_jump(OpCode::JumpIfFalseKeep, *line);
                self.fs().emit_op(OpCode::Pop, *line);
                self.expression(rhs)?;
                self.fs().patch_jump(skip, *line)
            }
            Expr::Or { lhs, rhs, line } => {
                self.expression(lhs)?;
                let skip = self.fs().emit_jump(OpCode::JumpIfTrueKeep, *line);
                self.fs().emit_op(OpCode::Pop, *line);
                self.expression(rhs)?;
                self.fs().patch_jump(skip, *line)
            }
        }
    }

    fn constant(&mut self, value: Constant, line: u32) -> Result<(), CompileError> {
        let idx = self.fs().add_constant(value, line)?;
        self.fs().emit_op(OpCode::Const, line);
        self.fs().emit_u16(idx, line);
        Ok(())
    }

    fn call_expression(&mut self, expr: &Expr, want: u8) -> Result<(), CompileError> {
        match expr {
            Expr::Call { callee, args, line } => self.call(callee, args, want, *line),
            Expr::MethodCall {
                recv,
                name,
                args,
                line,
            } => self.method_call(recv, name, args, want, *line),
            _ => unreachable!("call_expression only receives calls"),
        }
    }

    fn call(
        &mut self,
        callee: &Expr,
        args: &[Expr],
        want: u8,
        line: u32,
    ) -> Result<(), CompileError> {
        if args.len() > MAX_ARGS {
            return Err(CompileError::compile(line, "too many call arguments"));
        }
        self.expression(callee)?;
        self.record_call(callee_debug_name(callee), line);
        let spread = args.last().map(|a| a.is_call()).unwrap_or(false);
        if spread {
            for arg in &args[..args.len() - 1] {
                self.expression(arg)?;
            }
            self.call_expression(args.last().expect("spread implies args"), MULTI)?;
            self.fs().emit_op(OpCode::CallSpread, line);
            self.fs().emit_byte((args.len() - 1) as u8, line);
            self.fs().emit_byte(want, line);
        } else {
            for arg in args {
                self.expression(arg)?;
            }
            self.fs().emit_op(OpCode::Call, line);
            self.fs().emit_byte(args.len() as u8, line);
            self.fs().emit_byte(want, line);
        }
        Ok(())
    }

    fn method_call(
        &mut self,
        recv: &Expr,
        name: &str,
        args: &[Expr],
        want: u8,
        line: u32,
    ) -> Result<(), CompileError> {
        if args.len() > MAX_ARGS {
            return Err(CompileError::compile(line, "too many call arguments"));
        }
        self.expression(recv)?;
        self.record_call(Some(name.to_string()), line);
        for arg in args {
            self.expression(arg)?;
        }
        let idx = self.string_constant(name, line)?;
        self.fs().emit_op(OpCode::Invoke, line);
        self.fs().emit_u16(idx, line);
        self.fs().emit_byte(args.len() as u8, line);
        self.fs().emit_byte(want, line);
        Ok(())
    }

    fn record_call(&mut self, name: Option<String>, _line: u32) {
        if let Some(name) = name {
            let pc = self.fs().proto.code.len() as u32;
            self.fs().proto.calls.push(CallInfo { name, pc });
        }
    }

    fn table_constructor(&mut self, items: &[TableItem], line: u32) -> Result<(), CompileError> {
        let positional: Vec<&Expr> = items
            .iter()
            .filter_map(|i| match i {
                TableItem::Positional(e) => Some(e),
                _ => None,
            })
            .collect();
        let keyed: Vec<&TableItem> = items
            .iter()
            .filter(|i| !matches!(i, TableItem::Positional(_)))
            .collect();
        if positional.len() > u8::MAX as usize || keyed.len() > u8::MAX as usize {
            return Err(CompileError::compile(line, "table constructor too large"));
        }
        for expr in &positional {
            self.expression(expr)?;
        }
        for item in &keyed {
            match item {
                TableItem::Named(name, value) => {
                    self.constant(Constant::Str(name.clone()), line)?;
                    self.expression(value)?;
                }
                TableItem::Keyed(key, value) => {
                    self.expression(key)?;
                    self.expression(value)?;
                }
                TableItem::Positional(_) => unreachable!("filtered above"),
            }
        }
        self.fs().emit_op(OpCode::NewTable, line);
        self.fs().emit_byte(positional.len() as u8, line);
        self.fs().emit_byte(keyed.len() as u8, line);
        Ok(())
    }

    fn function_value(
        &mut self,
        _name: &str,
        params: &[String],
        body: &[Stmt],
        line: u32,
        last_line: u32,
    ) -> Result<(), CompileError> {
        if params.len() > MAX_LOCALS {
            return Err(CompileError::compile(line, "too many parameters"));
        }
        let source_name = self.source_name.clone();
        self.funcs
            .push(FuncState::new(&source_name, params.len() as u8, line, last_line));
        for param in params {
            self.declare_local(param, line)?;
        }
        self.block(body)?;
        let (proto, upvalues) = self.finish_function(last_line)?;
        let fs = self.fs();
        let index = fs.proto.protos.len();
        if index > u16::MAX as usize {
            return Err(CompileError::compile(line, "too many nested functions"));
        }
        fs.proto.protos.push(proto);
        fs.emit_op(OpCode::Closure, line);
        fs.emit_u16(index as u16, line);
        for up in &upvalues {
            fs.emit_byte(up.is_local as u8, line);
            fs.emit_byte(up.index, line);
        }
        Ok(())
    }
}

fn constants_identical(a: &Constant, b: &Constant) -> bool {
    match (a, b) {
        (Constant::Nil, Constant::Nil) => true,
        (Constant::Bool(a), Constant::Bool(b)) => a == b,
        (Constant::Int(a), Constant::Int(b)) => a == b,
        (Constant::Float(a), Constant::Float(b)) => a.to_bits() == b.to_bits(),
        (Constant::Str(a), Constant::Str(b)) => a == b,
        _ => false,
    }
}

fn callee_debug_name(callee: &Expr) -> Option<String> {
    match callee {
        Expr::Name { name, .. } => Some(name.clone()),
        Expr::Index { obj, index, .. } => {
            if let (Expr::Name { name, .. }, Expr::Str { value, .. }) = (obj.as_ref(), index.as_ref())
            {
                Some(format!("{name}.{value}"))
            } else {
                None
            }
        }
        _ => None,
    }
}

fn target_debug_name(target: &AssignTarget) -> String {
    match target {
        AssignTarget::Name(name) => name.clone(),
        AssignTarget::Index { index, .. } => match index {
            Expr::Str { value, .. } => value.clone(),
            _ => "<field>".to_string(),
        },
    }
}

fn stmt_line(stmt: &Stmt) -> u32 {
    match stmt {
        Stmt::Local { line, .. }
        | Stmt::Assign { line, .. }
        | Stmt::ExprStat { line, .. }
        | Stmt::If { line, .. }
        | Stmt::While { line, .. }
        | Stmt::NumericFor { line, .. }
        | Stmt::Return { line, .. }
        | Stmt::Break { line }
        | Stmt::Function { line, .. }
        | Stmt::LocalFunction { line, .. } => *line,
    }
}
