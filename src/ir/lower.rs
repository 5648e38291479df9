//! AST to IR Lowering — the Hunter code generator
//!
//! Walks a parsed (and import-flattened) program and drives the `IrBuilder`
//! to emit one module: an implicit `main` entry function for the top-level
//! statements plus one function per `fun` declaration.
//!
//! Hunter has no separate type-checking pass. A variable's static type is
//! recovered on demand from the expression that produced its binding; the
//! single resolution path lives in [`CodeGenerator::resolve_type`] and every
//! consumer (print formatting, equality dispatch, store sizing) goes through
//! it.

use std::collections::HashMap;

use thiserror::Error;

use crate::ast::{
    BooleanOp, DataType, Expression, ExpressionKind, IntWidth, MathOp, Program,
};

use super::builder::IrBuilder;
use super::instr::CmpOp;
use super::types::{IrType, Module, StructLayout, VReg};

/// Code generation errors
///
/// All of these are fatal: generation stops at the first one and the driver
/// reports it and exits non-zero.
#[derive(Error, Debug)]
pub enum CodegenError {
    #[error("could not find variable `{name}`")]
    UndefinedVariable { name: String },

    #[error("function not defined: `{name}`")]
    UndefinedFunction { name: String },

    #[error("struct not defined: `{name}`")]
    UndefinedStruct { name: String },

    #[error("struct `{struct_name}` has no field `{field}`")]
    UndefinedField { struct_name: String, field: String },

    #[error("variable `{name}` was already defined")]
    AlreadyDefined { name: String },

    #[error("function `{name}` was already defined")]
    FunctionAlreadyDefined { name: String },

    #[error("function `{name}` redeclared with a different signature")]
    SignatureMismatch { name: String },

    #[error("type mismatch: {message}")]
    TypeMismatch { message: String },

    #[error("unsupported construct: {message}")]
    UnsupportedConstruct { message: String },

    #[error("cannot use a value of unknown type: {context}")]
    UnknownType { context: String },
}

/// Code generation result
pub type CodegenResult<T> = Result<T, CodegenError>;

/// Generate the IR module for a parsed, import-flattened program
pub fn generate(program: &Program, module_name: &str) -> CodegenResult<Module> {
    CodeGenerator::new(module_name).run(program)
}

/// Signature of a registered function
struct FunctionInfo {
    param_types: Vec<DataType>,
    return_type: DataType,
    is_external: bool,
    /// A body has been (or will be) emitted for this name
    defined: bool,
}

/// A registered struct: the ordered field names with their source types
struct StructInfo {
    layout: StructLayout,
    field_types: Vec<(String, DataType)>,
}

/// Saved bindings for one scope frame (function-parameter save/restore)
#[derive(Default)]
struct ScopeFrame<'ast> {
    /// Bindings shadowed by this frame, restored on exit
    saved: Vec<(String, VReg, &'ast Expression)>,
    /// Names declared inside this frame, removed on exit
    declared: Vec<String>,
}

/// The mutable compilation environment: function, struct and variable tables
/// plus the scope stack. One instance lives for one compilation.
struct CompileEnv<'ast> {
    functions: HashMap<String, FunctionInfo>,
    structs: HashMap<String, StructInfo>,
    /// Variable name → storage slot
    variables: HashMap<String, VReg>,
    /// Variable name → the expression that produced the binding
    variable_decls: HashMap<String, &'ast Expression>,
    scopes: Vec<ScopeFrame<'ast>>,
}

impl<'ast> CompileEnv<'ast> {
    fn new() -> Self {
        Self {
            functions: HashMap::new(),
            structs: HashMap::new(),
            variables: HashMap::new(),
            variable_decls: HashMap::new(),
            scopes: Vec::new(),
        }
    }

    fn enter_scope(&mut self) {
        self.scopes.push(ScopeFrame::default());
    }

    fn exit_scope(&mut self) {
        if let Some(frame) = self.scopes.pop() {
            for name in frame.declared {
                self.variables.remove(&name);
                self.variable_decls.remove(&name);
            }
            for (name, slot, decl) in frame.saved {
                self.variables.insert(name.clone(), slot);
                self.variable_decls.insert(name, decl);
            }
        }
    }

    /// Bind a new variable; redeclaring a live name is fatal
    fn declare(&mut self, name: &str, slot: VReg, decl: &'ast Expression) -> CodegenResult<()> {
        if self.variables.contains_key(name) {
            return Err(CodegenError::AlreadyDefined {
                name: name.to_string(),
            });
        }
        self.variables.insert(name.to_string(), slot);
        self.variable_decls.insert(name.to_string(), decl);
        if let Some(frame) = self.scopes.last_mut() {
            frame.declared.push(name.to_string());
        }
        Ok(())
    }

    /// Bind a parameter, shadowing any outer binding until the scope exits
    fn declare_param(&mut self, name: &str, slot: VReg, decl: &'ast Expression) {
        let old_slot = self.variables.insert(name.to_string(), slot);
        let old_decl = self.variable_decls.insert(name.to_string(), decl);
        if let Some(frame) = self.scopes.last_mut() {
            if let (Some(old_slot), Some(old_decl)) = (old_slot, old_decl) {
                frame.saved.push((name.to_string(), old_slot, old_decl));
            }
            frame.declared.push(name.to_string());
        }
    }

    /// Drop a binding before its scope ends (loop counters)
    fn remove(&mut self, name: &str) {
        self.variables.remove(name);
        self.variable_decls.remove(name);
    }
}

/// Lowers a Hunter AST into an IR module
pub struct CodeGenerator<'ast> {
    builder: IrBuilder,
    env: CompileEnv<'ast>,
}

impl<'ast> CodeGenerator<'ast> {
    pub fn new(module_name: impl Into<String>) -> Self {
        Self {
            builder: IrBuilder::new(module_name),
            env: CompileEnv::new(),
        }
    }

    /// Run all passes over the program and return the finished module
    pub fn run(mut self, program: &'ast Program) -> CodegenResult<Module> {
        self.builder.declare_c_library();
        self.register_builtins();

        // First pass: struct layouts and function signatures, so calls and
        // constructions can resolve regardless of declaration order.
        for instr in &program.instructions {
            match &instr.kind {
                ExpressionKind::Struct { name, fields } => self.register_struct(name, fields)?,
                ExpressionKind::Function { .. } => self.register_function(instr)?,
                ExpressionKind::Extern { wrapped } => self.register_function(wrapped)?,
                _ => {}
            }
        }

        // Second pass: function bodies, in declaration order.
        for instr in &program.instructions {
            if let ExpressionKind::Function {
                name,
                params,
                return_type,
                is_external: false,
                body,
            } = &instr.kind
            {
                self.lower_function(name, params, return_type, body)?;
            }
        }

        // Third pass: the implicit entry function.
        self.lower_entry(program)?;

        Ok(self.builder.finish())
    }

    /// The C library functions are callable like any other extern
    fn register_builtins(&mut self) {
        self.env.functions.insert(
            "printf".to_string(),
            FunctionInfo {
                param_types: vec![DataType::String],
                return_type: DataType::Int(IntWidth::W32),
                is_external: true,
                defined: true,
            },
        );
        self.env.functions.insert(
            "strcmp".to_string(),
            FunctionInfo {
                param_types: vec![DataType::String, DataType::String],
                return_type: DataType::Int(IntWidth::W32),
                is_external: true,
                defined: true,
            },
        );
        self.env.functions.insert(
            "malloc".to_string(),
            FunctionInfo {
                param_types: vec![DataType::Int(IntWidth::W64)],
                return_type: DataType::Memory,
                is_external: true,
                defined: true,
            },
        );
    }

    fn register_struct(&mut self, name: &str, fields: &'ast [Expression]) -> CodegenResult<()> {
        if self.env.structs.contains_key(name) {
            return Err(CodegenError::AlreadyDefined {
                name: name.to_string(),
            });
        }

        let mut field_types = Vec::new();
        let mut ir_fields = Vec::new();
        for field in fields {
            match &field.kind {
                ExpressionKind::VariableDeclaration {
                    name: field_name,
                    declared_type: Some(ty),
                    ..
                } => {
                    ir_fields.push((field_name.clone(), self.ir_type(ty, field_name)?));
                    field_types.push((field_name.clone(), ty.clone()));
                }
                _ => {
                    return Err(CodegenError::UnsupportedConstruct {
                        message: format!("invalid field in struct `{}`", name),
                    })
                }
            }
        }

        let layout = StructLayout {
            name: name.to_string(),
            fields: ir_fields,
        };
        self.builder.add_struct_layout(layout.clone());
        self.env.structs.insert(
            name.to_string(),
            StructInfo {
                layout,
                field_types,
            },
        );
        Ok(())
    }

    /// Record a function signature; an `extern` declaration later defined
    /// locally reuses the same entry, a mismatched signature is fatal
    fn register_function(&mut self, decl: &'ast Expression) -> CodegenResult<()> {
        let (name, params, return_type, is_external) = match &decl.kind {
            ExpressionKind::Function {
                name,
                params,
                return_type,
                is_external,
                ..
            } => (name, params, return_type, *is_external),
            _ => {
                return Err(CodegenError::UnsupportedConstruct {
                    message: "expected a function declaration".to_string(),
                })
            }
        };

        let param_types: Vec<DataType> = params
            .iter()
            .map(|param| match &param.kind {
                ExpressionKind::VariableDeclaration {
                    declared_type: Some(ty),
                    ..
                } => Ok(ty.clone()),
                _ => Err(CodegenError::UnsupportedConstruct {
                    message: format!("invalid parameter of function `{}`", name),
                }),
            })
            .collect::<CodegenResult<_>>()?;

        if let Some(existing) = self.env.functions.get_mut(name) {
            if existing.param_types != param_types || existing.return_type != *return_type {
                return Err(CodegenError::SignatureMismatch { name: name.clone() });
            }
            if !is_external {
                if existing.defined {
                    return Err(CodegenError::FunctionAlreadyDefined { name: name.clone() });
                }
                existing.defined = true;
                existing.is_external = false;
            }
            return Ok(());
        }

        if is_external {
            let ir_params: Vec<IrType> = param_types
                .iter()
                .map(|ty| self.ir_type(ty, name))
                .collect::<CodegenResult<_>>()?;
            let ir_ret = self.ir_type(return_type, name)?;
            self.builder.declare_external(name.clone(), ir_params, ir_ret);
        }

        self.env.functions.insert(
            name.clone(),
            FunctionInfo {
                param_types,
                return_type: return_type.clone(),
                is_external,
                defined: !is_external,
            },
        );
        Ok(())
    }

    /// Lower one `fun` body into its own IR function
    fn lower_function(
        &mut self,
        name: &str,
        params: &'ast [Expression],
        return_type: &DataType,
        body: &'ast [Expression],
    ) -> CodegenResult<()> {
        let param_ir: Vec<IrType> = params
            .iter()
            .map(|param| match &param.kind {
                ExpressionKind::VariableDeclaration {
                    name: param_name,
                    declared_type: Some(ty),
                    ..
                } => self.ir_type(ty, param_name),
                _ => Err(CodegenError::UnsupportedConstruct {
                    message: format!("invalid parameter of function `{}`", name),
                }),
            })
            .collect::<CodegenResult<_>>()?;
        let ret_ir = self.ir_type(return_type, name)?;

        let param_vregs = self.builder.start_function(name, param_ir.clone(), ret_ir);
        self.env.enter_scope();

        // Each parameter gets its own stack slot initialized from the
        // incoming value.
        for ((param, vreg), ty) in params.iter().zip(param_vregs).zip(param_ir) {
            let param_name = match &param.kind {
                ExpressionKind::VariableDeclaration { name, .. } => name,
                _ => unreachable!("parameters are declarations"),
            };
            let slot = self.builder.alloca(ty);
            self.builder.store(slot, vreg);
            self.env.declare_param(param_name, slot, param);
        }

        for stmt in body {
            self.lower_statement(stmt)?;
        }

        if !self.builder.has_terminator() {
            self.builder.ret(None);
        }

        self.env.exit_scope();
        Ok(())
    }

    /// Lower the implicit entry function: every top-level statement that is
    /// not a declaration-only node, in order. A declared `hunt` function is
    /// called at the position of its declaration.
    fn lower_entry(&mut self, program: &'ast Program) -> CodegenResult<()> {
        self.builder.start_function("main", vec![], IrType::I32);
        self.env.enter_scope();

        for instr in &program.instructions {
            match &instr.kind {
                ExpressionKind::Function {
                    name,
                    is_external: false,
                    ..
                } => {
                    if name == "hunt" {
                        self.builder.call_void("hunt", vec![]);
                    }
                }
                ExpressionKind::Extern { .. }
                | ExpressionKind::Struct { .. }
                | ExpressionKind::Module { .. }
                | ExpressionKind::Import { .. } => {}
                _ => self.lower_statement(instr)?,
            }
        }

        if !self.builder.has_terminator() {
            let zero = self.builder.const_int(0);
            self.builder.ret(Some(zero));
        }

        self.env.exit_scope();
        Ok(())
    }

    // ============ Statements ============

    fn lower_statement(&mut self, stmt: &'ast Expression) -> CodegenResult<()> {
        match &stmt.kind {
            ExpressionKind::Print { call } => self.lower_print(call),
            ExpressionKind::VariableDeclaration {
                name,
                value: Some(value),
                ..
            } => self.lower_declaration(name, value),
            ExpressionKind::VariableMutation { name, value } => self.lower_mutation(name, value),
            ExpressionKind::If {
                condition,
                body,
                else_branch,
            } => self.lower_if(condition, body, else_branch.as_deref()),
            ExpressionKind::While { condition, body } => self.lower_while(condition, body),
            ExpressionKind::For {
                counter,
                range,
                body,
            } => self.lower_for(counter, range, body),
            ExpressionKind::FunctionCall { callee, args } => {
                self.lower_call(callee, args)?;
                Ok(())
            }
            ExpressionKind::FunctionReturn { value } => {
                let result = self.get_value(value)?;
                self.builder.ret(Some(result));
                Ok(())
            }
            other => Err(CodegenError::UnsupportedConstruct {
                message: format!("unhandled {} statement at {}", kind_name(other), stmt.pos),
            }),
        }
    }

    /// `const`/`let`: allocate storage sized to the initializer's type
    fn lower_declaration(&mut self, name: &str, value: &'ast Expression) -> CodegenResult<()> {
        if self.env.variables.contains_key(name) {
            return Err(CodegenError::AlreadyDefined {
                name: name.to_string(),
            });
        }

        match &value.kind {
            ExpressionKind::Str(text) => {
                let global = self.builder.add_string_constant(text);
                let data = self.builder.global_string_ptr(&global);
                let slot = self.builder.alloca(IrType::ptr(IrType::I8));
                self.builder.store(slot, data);
                self.env.declare(name, slot, value)
            }
            ExpressionKind::Int { width, value: int_value } => {
                let slot = self.builder.alloca(width_type(*width));
                let constant = self.builder.const_int(*int_value);
                self.builder.store(slot, constant);
                self.env.declare(name, slot, value)
            }
            ExpressionKind::FunctionCall { callee, args } => {
                let return_type = match self.env.functions.get(callee.as_str()) {
                    Some(info) => info.return_type.clone(),
                    None => {
                        return Err(CodegenError::UndefinedFunction {
                            name: callee.clone(),
                        })
                    }
                };
                if return_type == DataType::Void {
                    return Err(CodegenError::TypeMismatch {
                        message: format!("cannot bind the void result of `{}`", callee),
                    });
                }
                let slot_type = self.ir_type(&return_type, name)?;
                let result = self.lower_call(callee, args)?;
                let slot = self.builder.alloca(slot_type);
                self.builder.store(slot, result);
                self.env.declare(name, slot, value)
            }
            ExpressionKind::StructConstruction {
                struct_name,
                field_values,
            } => {
                let data = self.lower_struct_construction(struct_name, field_values)?;
                let slot = self.builder.alloca(IrType::ptr(IrType::I8));
                self.builder.store(slot, data);
                self.env.declare(name, slot, value)
            }
            _ => Err(CodegenError::UnsupportedConstruct {
                message: format!("invalid initializer for variable `{}`", name),
            }),
        }
    }

    /// Heap-allocate the struct and store each field at its positional offset
    fn lower_struct_construction(
        &mut self,
        struct_name: &str,
        field_values: &'ast [Expression],
    ) -> CodegenResult<VReg> {
        let (ir_type, field_count) = match self.env.structs.get(struct_name) {
            Some(info) => (info.layout.ir_type(), info.layout.fields.len()),
            None => {
                return Err(CodegenError::UndefinedStruct {
                    name: struct_name.to_string(),
                })
            }
        };
        if field_values.len() != field_count {
            return Err(CodegenError::TypeMismatch {
                message: format!(
                    "struct `{}` has {} fields but {} values were supplied",
                    struct_name,
                    field_count,
                    field_values.len()
                ),
            });
        }

        let data = self.builder.malloc(ir_type);
        for (index, field_value) in field_values.iter().enumerate() {
            let value = self.get_value(field_value)?;
            let field_ptr = self.builder.get_field_ptr(data, index as u32);
            self.builder.store(field_ptr, value);
        }
        Ok(data)
    }

    /// Only `name = name + value` shaped updates are implemented
    fn lower_mutation(&mut self, name: &str, value: &'ast Expression) -> CodegenResult<()> {
        let slot = match self.env.variables.get(name) {
            Some(slot) => *slot,
            None => {
                return Err(CodegenError::UndefinedVariable {
                    name: name.to_string(),
                })
            }
        };

        match &value.kind {
            ExpressionKind::Operation {
                op: MathOp::Add,
                left: Some(left),
                right: Some(right),
            } => {
                let left_value = self.get_value(left)?;
                let right_value = self.get_value(right)?;
                let next = self.builder.add(left_value, right_value);
                self.builder.store(slot, next);
                Ok(())
            }
            ExpressionKind::Operation { op, .. } => Err(CodegenError::UnsupportedConstruct {
                message: format!("variable mutation with operator `{}` is not implemented", op),
            }),
            _ => Err(CodegenError::UnsupportedConstruct {
                message: "variable mutation without an operation is not implemented".to_string(),
            }),
        }
    }

    /// then/else/merge; a missing else still gets an (empty) else block
    fn lower_if(
        &mut self,
        condition: &'ast Expression,
        body: &'ast [Expression],
        else_branch: Option<&'ast Expression>,
    ) -> CodegenResult<()> {
        let cond = self.lower_condition(condition)?;

        let then_block = self.builder.create_block();
        let else_block = self.builder.create_block();
        let merge_block = self.builder.create_block();

        self.builder.cond_br(cond, then_block, else_block);

        self.builder.start_block(then_block);
        for stmt in body {
            self.lower_statement(stmt)?;
        }
        if !self.builder.has_terminator() {
            self.builder.br(merge_block);
        }

        self.builder.start_block(else_block);
        if let Some(else_branch) = else_branch {
            match &else_branch.kind {
                ExpressionKind::Else { body } => {
                    for stmt in body {
                        self.lower_statement(stmt)?;
                    }
                }
                _ => {
                    return Err(CodegenError::UnsupportedConstruct {
                        message: "malformed else branch".to_string(),
                    })
                }
            }
        }
        if !self.builder.has_terminator() {
            self.builder.br(merge_block);
        }

        self.builder.start_block(merge_block);
        Ok(())
    }

    /// check/body/exit; the condition is re-evaluated every iteration
    fn lower_while(
        &mut self,
        condition: &'ast Expression,
        body: &'ast [Expression],
    ) -> CodegenResult<()> {
        let check_block = self.builder.create_block();
        let body_block = self.builder.create_block();
        let exit_block = self.builder.create_block();

        self.builder.br(check_block);

        self.builder.start_block(check_block);
        let cond = self.lower_condition(condition)?;
        self.builder.cond_br(cond, body_block, exit_block);

        self.builder.start_block(body_block);
        for stmt in body {
            self.lower_statement(stmt)?;
        }
        if !self.builder.has_terminator() {
            self.builder.br(check_block);
        }

        self.builder.start_block(exit_block);
        Ok(())
    }

    /// Desugars to a 64-bit counter: init to `start`, run the body, add 1,
    /// branch back while counter <= `end` (the upper bound is included). The
    /// counter is loop-local.
    fn lower_for(
        &mut self,
        counter: &str,
        range: &'ast Expression,
        body: &'ast [Expression],
    ) -> CodegenResult<()> {
        let (start, end) = match range.kind {
            ExpressionKind::Range { start, end } => (start, end),
            _ => {
                return Err(CodegenError::UnsupportedConstruct {
                    message: "unknown expression type for range".to_string(),
                })
            }
        };

        let slot = self.builder.alloca(IrType::I64);
        let start_value = self.builder.const_int(start);
        self.builder.store(slot, start_value);
        // The range expression stands in as the counter's declaration; it
        // resolves to a 64-bit integer.
        self.env.declare(counter, slot, range)?;

        let loop_block = self.builder.create_block();
        let exit_block = self.builder.create_block();

        self.builder.br(loop_block);
        self.builder.start_block(loop_block);

        for stmt in body {
            self.lower_statement(stmt)?;
        }

        let loaded = self.builder.load(slot);
        let step = self.builder.const_int(1);
        let next = self.builder.add(loaded, step);
        self.builder.store(slot, next);

        let next_loaded = self.builder.load(slot);
        let end_value = self.builder.const_int(end);
        let keep_going = self.builder.icmp(CmpOp::Sle, next_loaded, end_value);
        self.builder.cond_br(keep_going, loop_block, exit_block);

        self.builder.start_block(exit_block);
        self.env.remove(counter);
        Ok(())
    }

    /// Build one format placeholder per argument from its resolved type and
    /// call printf with the loaded values
    fn lower_print(&mut self, call: &'ast Expression) -> CodegenResult<()> {
        let args = match &call.kind {
            ExpressionKind::FunctionCall { args, .. } => args,
            _ => {
                return Err(CodegenError::UnsupportedConstruct {
                    message: "malformed print statement".to_string(),
                })
            }
        };

        let mut format = String::new();
        let mut ops: Vec<VReg> = Vec::new();

        for arg in args {
            match &arg.kind {
                ExpressionKind::Str(text) => {
                    let global = self.builder.add_string_constant(text);
                    ops.push(self.builder.global_string_ptr(&global));
                    format.push_str("%s");
                }
                ExpressionKind::Int { width, value } => {
                    ops.push(self.builder.const_int(*value));
                    format.push_str(int_placeholder(*width));
                }
                ExpressionKind::Identifier(name) => {
                    let value = self.variable_value(name)?;
                    match self.resolve_variable_type(name) {
                        DataType::String => format.push_str("%s"),
                        DataType::Int(width) => format.push_str(int_placeholder(width)),
                        DataType::Unknown => {
                            return Err(CodegenError::UnknownType {
                                context: format!("variable `{}` in print", name),
                            })
                        }
                        other => {
                            return Err(CodegenError::TypeMismatch {
                                message: format!("cannot print a value of type `{}`", other),
                            })
                        }
                    }
                    ops.push(value);
                }
                ExpressionKind::FunctionCall { callee, args: call_args } => {
                    let return_type = match self.env.functions.get(callee.as_str()) {
                        Some(info) => info.return_type.clone(),
                        None => {
                            return Err(CodegenError::UndefinedFunction {
                                name: callee.clone(),
                            })
                        }
                    };
                    match return_type {
                        DataType::String => format.push_str("%s"),
                        DataType::Int(width) => format.push_str(int_placeholder(width)),
                        other => {
                            return Err(CodegenError::TypeMismatch {
                                message: format!("cannot print a value of type `{}`", other),
                            })
                        }
                    }
                    let result = self.lower_call(callee, call_args)?;
                    ops.push(result);
                }
                _ => {
                    return Err(CodegenError::UnsupportedConstruct {
                        message: "unsupported expression for print parameter".to_string(),
                    })
                }
            }
        }

        let format_global = self.builder.add_string_constant(&format);
        let format_ptr = self.builder.global_string_ptr(&format_global);
        let mut call_ops = vec![format_ptr];
        call_ops.extend(ops);
        self.builder.call_void("printf", call_ops);
        Ok(())
    }

    /// Call a registered function with value arguments
    fn lower_call(&mut self, callee: &str, args: &'ast [Expression]) -> CodegenResult<VReg> {
        if !self.env.functions.contains_key(callee) {
            return Err(CodegenError::UndefinedFunction {
                name: callee.to_string(),
            });
        }

        let mut ops = Vec::new();
        for arg in args {
            ops.push(self.get_value(arg)?);
        }
        Ok(self.builder.call(callee, ops))
    }

    // ============ Values ============

    /// Map a value expression to a register
    fn get_value(&mut self, expr: &'ast Expression) -> CodegenResult<VReg> {
        match &expr.kind {
            ExpressionKind::Int { value, .. } => Ok(self.builder.const_int(*value)),
            ExpressionKind::Str(text) => {
                let global = self.builder.add_string_constant(text);
                Ok(self.builder.global_string_ptr(&global))
            }
            ExpressionKind::Identifier(name) => self.variable_value(name),
            ExpressionKind::FunctionCall { callee, args } => self.lower_call(callee, args),
            _ => Err(CodegenError::UnsupportedConstruct {
                message: format!("could not map expression at {} to a value", expr.pos),
            }),
        }
    }

    /// Load a variable's current value; `base.field` loads through the
    /// struct's positional field offset
    fn variable_value(&mut self, name: &str) -> CodegenResult<VReg> {
        if let Some((base, field)) = name.split_once('.') {
            return self.struct_field_value(base, field);
        }

        let slot = match self.env.variables.get(name) {
            Some(slot) => *slot,
            None => {
                return Err(CodegenError::UndefinedVariable {
                    name: name.to_string(),
                })
            }
        };
        Ok(self.builder.load(slot))
    }

    fn struct_field_value(&mut self, base: &str, field: &str) -> CodegenResult<VReg> {
        let slot = match self.env.variables.get(base) {
            Some(slot) => *slot,
            None => {
                return Err(CodegenError::UndefinedVariable {
                    name: base.to_string(),
                })
            }
        };

        let struct_name = match self.resolve_variable_type(base) {
            DataType::Struct(struct_name) => struct_name,
            other => {
                return Err(CodegenError::TypeMismatch {
                    message: format!(
                        "`{}` is of type `{}` and has no field `{}`",
                        base, other, field
                    ),
                })
            }
        };

        let index = match self
            .env
            .structs
            .get(&struct_name)
            .and_then(|info| info.layout.field_index(field))
        {
            Some(index) => index,
            None => {
                return Err(CodegenError::UndefinedField {
                    struct_name,
                    field: field.to_string(),
                })
            }
        };

        let data = self.builder.load(slot);
        let field_ptr = self.builder.get_field_ptr(data, index as u32);
        Ok(self.builder.load(field_ptr))
    }

    // ============ Conditions ============

    fn lower_condition(&mut self, condition: &'ast Expression) -> CodegenResult<VReg> {
        let (op, left, right) = match &condition.kind {
            ExpressionKind::Boolean { op, left, right } => (op, left, right.as_deref()),
            _ => {
                return Err(CodegenError::UnsupportedConstruct {
                    message: "invalid expression type for condition".to_string(),
                })
            }
        };

        match op {
            BooleanOp::Equals => self.equals_condition(left, right),
            BooleanOp::Lower => self.ordered_condition(CmpOp::Slt, left, right),
            BooleanOp::LowerEquals => self.ordered_condition(CmpOp::Sle, left, right),
            BooleanOp::Greater => self.ordered_condition(CmpOp::Sgt, left, right),
            BooleanOp::GreaterEquals => self.ordered_condition(CmpOp::Sge, left, right),
            other => Err(CodegenError::UnsupportedConstruct {
                message: format!("operator `{}` is not supported in conditions", other),
            }),
        }
    }

    /// Integer equality for integer operands, strcmp-against-zero for string
    /// operands; anything else is a type mismatch
    fn equals_condition(
        &mut self,
        left: &'ast Expression,
        right: Option<&'ast Expression>,
    ) -> CodegenResult<VReg> {
        let right = right.ok_or_else(|| CodegenError::UnsupportedConstruct {
            message: "`eq` requires two operands".to_string(),
        })?;

        let left_type = self.resolve_type(left);
        let right_type = self.resolve_type(right);

        if left_type.is_int() && right_type.is_int() {
            let left_value = self.get_value(left)?;
            let right_value = self.get_value(right)?;
            return Ok(self.builder.icmp(CmpOp::Eq, left_value, right_value));
        }

        if left_type == DataType::String && right_type == DataType::String {
            let left_value = self.get_value(left)?;
            let right_value = self.get_value(right)?;
            let compared = self.builder.call("strcmp", vec![left_value, right_value]);
            let zero = self.builder.const_int(0);
            return Ok(self.builder.icmp(CmpOp::Eq, compared, zero));
        }

        Err(CodegenError::TypeMismatch {
            message: format!(
                "unsupported equals operation between `{}` and `{}`",
                left_type, right_type
            ),
        })
    }

    /// Ordered comparisons are signed-integer-only
    fn ordered_condition(
        &mut self,
        op: CmpOp,
        left: &'ast Expression,
        right: Option<&'ast Expression>,
    ) -> CodegenResult<VReg> {
        let right = right.ok_or_else(|| CodegenError::UnsupportedConstruct {
            message: "comparison requires two operands".to_string(),
        })?;
        let left_value = self.get_value(left)?;
        let right_value = self.get_value(right)?;
        Ok(self.builder.icmp(op, left_value, right_value))
    }

    // ============ Type resolution ============

    /// The single resolution path from an expression to its static type.
    /// A variable's type comes from the expression that produced its binding;
    /// there is no stored type tag.
    fn resolve_type(&self, expr: &Expression) -> DataType {
        match &expr.kind {
            ExpressionKind::Str(_) => DataType::String,
            ExpressionKind::Int { width, .. } => DataType::Int(*width),
            ExpressionKind::Identifier(name) => self.resolve_variable_type(name),
            ExpressionKind::VariableDeclaration {
                declared_type: Some(ty),
                ..
            } => ty.clone(),
            ExpressionKind::FunctionCall { callee, .. } => self
                .env
                .functions
                .get(callee.as_str())
                .map(|info| info.return_type.clone())
                .unwrap_or(DataType::Unknown),
            ExpressionKind::StructConstruction { struct_name, .. } => {
                DataType::Struct(struct_name.clone())
            }
            // For-loop counters are bound to their range: 64-bit
            ExpressionKind::Range { .. } => DataType::Int(IntWidth::W64),
            _ => DataType::Unknown,
        }
    }

    fn resolve_variable_type(&self, name: &str) -> DataType {
        if let Some((base, field)) = name.split_once('.') {
            if let DataType::Struct(struct_name) = self.resolve_variable_type(base) {
                if let Some(info) = self.env.structs.get(&struct_name) {
                    if let Some((_, ty)) =
                        info.field_types.iter().find(|(field_name, _)| field_name == field)
                    {
                        return ty.clone();
                    }
                }
            }
            return DataType::Unknown;
        }

        match self.env.variable_decls.get(name) {
            Some(decl) => self.resolve_type(decl),
            None => DataType::Unknown,
        }
    }

    /// Storage type for a source-level data type
    fn ir_type(&self, data_type: &DataType, context: &str) -> CodegenResult<IrType> {
        match data_type {
            DataType::Void => Ok(IrType::Void),
            DataType::String => Ok(IrType::ptr(IrType::I8)),
            DataType::Memory => Ok(IrType::ptr(IrType::I8)),
            DataType::Int(width) => Ok(width_type(*width)),
            DataType::Struct(name) => match self.env.structs.get(name) {
                Some(info) => Ok(IrType::ptr(info.layout.ir_type())),
                None => Err(CodegenError::UndefinedStruct { name: name.clone() }),
            },
            DataType::List(inner) => Ok(IrType::ptr(self.ir_type(inner, context)?)),
            DataType::Unknown => Err(CodegenError::UnknownType {
                context: context.to_string(),
            }),
        }
    }
}

fn width_type(width: IntWidth) -> IrType {
    match width {
        IntWidth::W8 => IrType::I8,
        IntWidth::W16 => IrType::I16,
        IntWidth::W32 => IrType::I32,
        IntWidth::W64 => IrType::I64,
    }
}

/// printf placeholder for an integer of the given width
fn int_placeholder(width: IntWidth) -> &'static str {
    if width == IntWidth::W64 {
        "%lld"
    } else {
        "%d"
    }
}

fn kind_name(kind: &ExpressionKind) -> &'static str {
    match kind {
        ExpressionKind::Str(_) => "string",
        ExpressionKind::Int { .. } => "int",
        ExpressionKind::Identifier(_) => "identifier",
        ExpressionKind::Range { .. } => "range",
        ExpressionKind::VariableDeclaration { .. } => "variable declaration",
        ExpressionKind::VariableMutation { .. } => "variable mutation",
        ExpressionKind::Boolean { .. } => "boolean",
        ExpressionKind::Operation { .. } => "operation",
        ExpressionKind::FunctionCall { .. } => "function call",
        ExpressionKind::FunctionReturn { .. } => "return",
        ExpressionKind::Print { .. } => "print",
        ExpressionKind::Function { .. } => "function",
        ExpressionKind::If { .. } => "if",
        ExpressionKind::Else { .. } => "else",
        ExpressionKind::While { .. } => "while",
        ExpressionKind::For { .. } => "for",
        ExpressionKind::Struct { .. } => "struct",
        ExpressionKind::StructConstruction { .. } => "struct construction",
        ExpressionKind::Module { .. } => "module",
        ExpressionKind::Import { .. } => "import",
        ExpressionKind::Extern { .. } => "extern",
    }
}

// ============ Module printing ============

/// Print a module in a readable format
pub fn print_module(module: &Module) -> String {
    let mut output = String::new();
    output.push_str(&format!("module {}\n\n", module.name));

    for layout in &module.structs {
        output.push_str(&format!("struct {} ", layout.name));
        output.push_str("{ ");
        for (i, (name, ty)) in layout.fields.iter().enumerate() {
            if i > 0 {
                output.push_str(", ");
            }
            output.push_str(&format!("{}: {}", name, ty));
        }
        output.push_str(" }\n");
    }
    if !module.structs.is_empty() {
        output.push('\n');
    }

    for global in &module.globals {
        match &global.init {
            Some(init) => output.push_str(&format!(
                "global @{} : {} = {}\n",
                global.name, global.ty, init
            )),
            None => output.push_str(&format!("global @{} : {}\n", global.name, global.ty)),
        }
    }
    if !module.globals.is_empty() {
        output.push('\n');
    }

    for func in &module.functions {
        if func.is_external {
            output.push_str(&format!("declare {} ", func.name));
        } else {
            output.push_str(&format!("define {} ", func.name));
        }

        output.push('(');
        for (i, (vreg, ty)) in func.params.iter().enumerate() {
            if i > 0 {
                output.push_str(", ");
            }
            if func.is_external {
                output.push_str(&format!("{}", ty));
            } else {
                output.push_str(&format!("{} {}", ty, vreg));
            }
        }
        if func.is_vararg {
            if !func.params.is_empty() {
                output.push_str(", ");
            }
            output.push_str("...");
        }
        output.push_str(&format!(") -> {} ", func.ret_type));

        if func.is_external {
            output.push('\n');
            continue;
        }

        output.push_str("{\n");
        for block in &func.blocks {
            output.push_str(&format!("  {}:\n", block.id));
            for instr in &block.instructions {
                output.push_str(&format!("    {}\n", instr));
            }
            if let Some(ref term) = block.terminator {
                output.push_str(&format!("    {}\n", term));
            }
        }
        output.push_str("}\n\n");
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Constant, InstrKind, Instruction, Terminator};
    use crate::parser::parse;

    fn gen(source: &str) -> Module {
        let program = parse(source).expect("parse");
        match generate(&program, "test") {
            Ok(module) => module,
            Err(err) => panic!("Codegen error: {}", err),
        }
    }

    fn gen_err(source: &str) -> CodegenError {
        let program = parse(source).expect("parse");
        match generate(&program, "test") {
            Ok(_) => panic!("expected codegen to fail"),
            Err(err) => err,
        }
    }

    fn instructions_of<'m>(module: &'m Module, name: &str) -> Vec<&'m Instruction> {
        module
            .get_function(name)
            .unwrap_or_else(|| panic!("function `{}` missing", name))
            .blocks
            .iter()
            .flat_map(|block| block.instructions.iter())
            .collect()
    }

    fn string_globals(module: &Module) -> Vec<String> {
        module
            .globals
            .iter()
            .filter_map(|g| match &g.init {
                Some(Constant::String(s)) => Some(s.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_entry_function_returns_zero() {
        let module = gen("print(\"hello\")\n");
        let main = module.get_function("main").expect("entry function");
        assert_eq!(main.ret_type, IrType::I32);
        let last = main.blocks.last().unwrap();
        assert!(matches!(last.terminator, Some(Terminator::Ret(Some(_)))));
    }

    #[test]
    fn test_c_library_registered() {
        let module = gen("print(\"x\")\n");
        assert!(module.get_function("printf").unwrap().is_external);
        assert!(module.get_function("strcmp").unwrap().is_external);
        assert!(module.get_function("malloc").unwrap().is_external);
    }

    #[test]
    fn test_hunt_function_called_from_entry() {
        let module = gen("fun hunt()\n  print(\"hunting\")\n");
        let calls: Vec<_> = instructions_of(&module, "main")
            .into_iter()
            .filter_map(|instr| match &instr.kind {
                InstrKind::Call { func, .. } => Some(func.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(calls, vec!["hunt".to_string()]);
    }

    #[test]
    fn test_plain_function_not_called_from_entry() {
        let module = gen("fun helper()\n  print(\"x\")\n");
        let calls = instructions_of(&module, "main")
            .into_iter()
            .filter(|instr| matches!(&instr.kind, InstrKind::Call { .. }))
            .count();
        assert_eq!(calls, 0);
    }

    #[test]
    fn test_function_parameters_get_stack_slots() {
        let module = gen("fun add(a: i64, b: i64) : i64\n  return a\n");
        let func = module.get_function("add").expect("function");
        assert_eq!(func.params.len(), 2);
        assert_eq!(func.ret_type, IrType::I64);
        let entry = func.entry_block().unwrap();
        let allocas = entry
            .instructions
            .iter()
            .filter(|i| matches!(i.kind, InstrKind::Alloca(IrType::I64)))
            .count();
        assert_eq!(allocas, 2);
    }

    #[test]
    fn test_implicit_void_return() {
        let module = gen("fun noop()\n  print(\"x\")\n");
        let func = module.get_function("noop").unwrap();
        assert!(matches!(
            func.blocks.last().unwrap().terminator,
            Some(Terminator::Ret(None))
        ));
    }

    #[test]
    fn test_declaration_width_sizes_slot() {
        let module = gen("const small = 5\nconst big = 3000000000\n");
        let instrs = instructions_of(&module, "main");
        assert!(instrs
            .iter()
            .any(|i| matches!(i.kind, InstrKind::Alloca(IrType::I8))));
        assert!(instrs
            .iter()
            .any(|i| matches!(i.kind, InstrKind::Alloca(IrType::I64))));
    }

    #[test]
    fn test_redeclaration_rejected() {
        let err = gen_err("const x = 1\nconst x = 2\n");
        assert!(matches!(err, CodegenError::AlreadyDefined { name } if name == "x"));
    }

    #[test]
    fn test_for_loop_bounds_inclusive() {
        let module = gen("for i in 1..10\n  print(i)\n");
        let instrs = instructions_of(&module, "main");

        // 64-bit counter initialized to 1
        assert!(instrs
            .iter()
            .any(|i| matches!(i.kind, InstrKind::Alloca(IrType::I64))));
        assert!(instrs
            .iter()
            .any(|i| matches!(i.kind, InstrKind::Const(Constant::Int(1)))));

        // continuation test is `counter <= 10`
        let sle = instrs
            .iter()
            .filter_map(|i| match i.kind {
                InstrKind::ICmp(CmpOp::Sle, _, b) => Some(b),
                _ => None,
            })
            .next();
        assert!(sle.is_some(), "expected a signed <= comparison");
        assert!(instrs
            .iter()
            .any(|i| matches!(i.kind, InstrKind::Const(Constant::Int(10)))));

        // the loop body block branches back on success
        let main = module.get_function("main").unwrap();
        let cond_br = main
            .blocks
            .iter()
            .find_map(|b| match &b.terminator {
                Some(Terminator::CondBr { then_block, .. }) => Some((b.id, *then_block)),
                _ => None,
            });
        let (branch_block, target) = cond_br.expect("loop branch");
        assert_eq!(branch_block, target, "loop branches back to its own block");
    }

    #[test]
    fn test_counter_is_loop_local() {
        let err = gen_err("for i in 1..3\n  print(i)\nprint(i)\n");
        assert!(matches!(err, CodegenError::UndefinedVariable { name } if name == "i"));
    }

    #[test]
    fn test_integer_equality_lowering() {
        let module = gen("const a = 1\nconst b = 2\nif a eq b then\n  print(\"same\")\n");
        let instrs = instructions_of(&module, "main");
        assert!(instrs
            .iter()
            .any(|i| matches!(i.kind, InstrKind::ICmp(CmpOp::Eq, _, _))));
        assert!(!instrs
            .iter()
            .any(|i| matches!(&i.kind, InstrKind::Call { func, .. } if func == "strcmp")));
    }

    #[test]
    fn test_string_equality_uses_strcmp() {
        let module =
            gen("const a = \"x\"\nconst b = \"y\"\nif a eq b then\n  print(\"same\")\n");
        let instrs = instructions_of(&module, "main");
        assert!(instrs
            .iter()
            .any(|i| matches!(&i.kind, InstrKind::Call { func, .. } if func == "strcmp")));
    }

    #[test]
    fn test_mixed_equality_rejected() {
        let err = gen_err("const a = \"x\"\nconst b = 2\nif a eq b then\n  print(\"same\")\n");
        assert!(matches!(err, CodegenError::TypeMismatch { .. }));
    }

    #[test]
    fn test_if_else_blocks_converge() {
        let module = gen(
            "const a = 1\nif a eq 1 then\n  print(\"one\")\nelse\n  print(\"other\")\nprint(\"after\")\n",
        );
        let main = module.get_function("main").unwrap();
        // entry + then + else + merge
        assert!(main.blocks.len() >= 4);
        let merge_targets: Vec<_> = main
            .blocks
            .iter()
            .filter_map(|b| match &b.terminator {
                Some(Terminator::Br(target)) => Some(*target),
                _ => None,
            })
            .collect();
        assert_eq!(merge_targets.len(), 2);
        assert_eq!(merge_targets[0], merge_targets[1]);
    }

    #[test]
    fn test_missing_else_still_branches() {
        let module = gen("const a = 1\nif a eq 1 then\n  print(\"one\")\n");
        let main = module.get_function("main").unwrap();
        let unconditional = main
            .blocks
            .iter()
            .filter(|b| matches!(b.terminator, Some(Terminator::Br(_))))
            .count();
        assert_eq!(unconditional, 2);
    }

    #[test]
    fn test_while_reevaluates_condition() {
        let module = gen("let x = 0\nwhile x < 3\n  x = x + 1\n");
        let main = module.get_function("main").unwrap();
        let check_block = main
            .blocks
            .iter()
            .find(|b| {
                b.instructions
                    .iter()
                    .any(|i| matches!(i.kind, InstrKind::ICmp(CmpOp::Slt, _, _)))
            })
            .expect("condition block");
        // the body jumps back into the block holding the comparison
        assert!(main.blocks.iter().any(|b| matches!(
            b.terminator,
            Some(Terminator::Br(target)) if target == check_block.id && b.id != check_block.id
        )));
    }

    #[test]
    fn test_mutation_lowering() {
        let module = gen("let x = 1\nx = x + 1\n");
        let instrs = instructions_of(&module, "main");
        assert!(instrs
            .iter()
            .any(|i| matches!(i.kind, InstrKind::Add(_, _))));
        let stores = instrs
            .iter()
            .filter(|i| matches!(i.kind, InstrKind::Store(_, _)))
            .count();
        assert_eq!(stores, 2);
    }

    #[test]
    fn test_non_add_mutation_rejected() {
        let err = gen_err("let x = 1\nx = x * 2\n");
        assert!(matches!(err, CodegenError::UnsupportedConstruct { .. }));
    }

    #[test]
    fn test_print_format_string() {
        let module = gen("const s = \"hi\"\nconst n = 1\nconst big = 3000000000\nprint(s, n, big)\n");
        let globals = string_globals(&module);
        assert!(globals.iter().any(|s| s == "%s%d%lld"));
    }

    #[test]
    fn test_print_struct_field() {
        let module = gen(
            "struct Point\n  x: i32\n  y: i32\nconst p = Point(3, 4)\nprint(p.y)\n",
        );
        let instrs = instructions_of(&module, "main");
        assert!(instrs
            .iter()
            .any(|i| matches!(i.kind, InstrKind::Malloc(_))));
        assert!(instrs
            .iter()
            .any(|i| matches!(i.kind, InstrKind::GetFieldPtr(_, 1))));
        let globals = string_globals(&module);
        assert!(globals.iter().any(|s| s == "%d"));
    }

    #[test]
    fn test_struct_construction_stores_fields_positionally() {
        let module = gen("struct Pair\n  a: i64\n  b: i64\nconst p = Pair(1, 2)\n");
        let instrs = instructions_of(&module, "main");
        assert!(instrs
            .iter()
            .any(|i| matches!(i.kind, InstrKind::GetFieldPtr(_, 0))));
        assert!(instrs
            .iter()
            .any(|i| matches!(i.kind, InstrKind::GetFieldPtr(_, 1))));
        assert_eq!(
            module.structs.len(),
            1,
            "struct layout recorded on the module"
        );
    }

    #[test]
    fn test_wrong_field_count_rejected() {
        let err = gen_err("struct Pair\n  a: i64\n  b: i64\nconst p = Pair(1)\n");
        assert!(matches!(err, CodegenError::TypeMismatch { .. }));
    }

    #[test]
    fn test_undefined_function_call_rejected() {
        let err = gen_err("missing(1)\n");
        assert!(matches!(err, CodegenError::UndefinedFunction { name } if name == "missing"));
    }

    #[test]
    fn test_undefined_variable_rejected() {
        let err = gen_err("print(ghost)\n");
        assert!(matches!(err, CodegenError::UndefinedVariable { name } if name == "ghost"));
    }

    #[test]
    fn test_call_result_binding() {
        let module = gen("fun one() : i8\n  return 1\nconst x = one()\nprint(x)\n");
        let instrs = instructions_of(&module, "main");
        assert!(instrs
            .iter()
            .any(|i| matches!(&i.kind, InstrKind::Call { func, .. } if func == "one")));
        assert!(instrs
            .iter()
            .any(|i| matches!(i.kind, InstrKind::Alloca(IrType::I8))));
        let globals = string_globals(&module);
        assert!(globals.iter().any(|s| s == "%d"));
    }

    #[test]
    fn test_extern_then_definition_reuses_handle() {
        let module = gen("extern fun helper(a: i8)\nfun helper(a: i8)\n  print(\"x\")\n");
        let matching: Vec<_> = module
            .functions
            .iter()
            .filter(|f| f.name == "helper")
            .collect();
        assert_eq!(matching.len(), 1);
        assert!(!matching[0].is_external);
    }

    #[test]
    fn test_extern_signature_mismatch_rejected() {
        let err = gen_err("extern fun helper(a: i8)\nfun helper(a: i8, b: i8)\n  print(\"x\")\n");
        assert!(matches!(err, CodegenError::SignatureMismatch { name } if name == "helper"));
    }

    #[test]
    fn test_duplicate_function_rejected() {
        let err = gen_err("fun f()\n  print(\"a\")\nfun f()\n  print(\"b\")\n");
        assert!(matches!(err, CodegenError::FunctionAlreadyDefined { name } if name == "f"));
    }

    #[test]
    fn test_extern_registers_signature_only() {
        let module = gen("extern fun putchar(c: i32)\n");
        let func = module.get_function("putchar").expect("declared");
        assert!(func.is_external);
        assert!(func.blocks.is_empty());
    }

    #[test]
    fn test_print_module_output() {
        let module = gen("fun hunt()\n  print(\"hello\")\n");
        let text = print_module(&module);
        assert!(text.contains("module test"));
        assert!(text.contains("define hunt"));
        assert!(text.contains("define main"));
        assert!(text.contains("declare printf"));
        assert!(text.contains("call hunt()"));
    }

    #[test]
    fn test_condition_bitwise_operator_unsupported() {
        let err = gen_err("const a = 1\nconst b = 1\nif a & b then\n  print(\"x\")\n");
        assert!(matches!(err, CodegenError::UnsupportedConstruct { .. }));
    }
}
