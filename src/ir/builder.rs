//! IR Builder
//!
//! Helper for constructing IR instructions and basic blocks.

use super::instr::{CmpOp, Instruction, InstrKind, Terminator};
use super::types::{BasicBlock, BlockId, Constant, Function, Global, IrType, Module, StructLayout, VReg};

/// Builder for constructing IR
pub struct IrBuilder {
    /// Next virtual register ID
    next_vreg: u32,
    /// Next block ID
    next_block: u32,
    /// Next string constant ID
    next_string: u32,
    /// Current module being built
    module: Module,
    /// Current function being built
    current_fn: Option<Function>,
    /// Current block being built
    current_block: Option<BasicBlock>,
    /// Track if the C library primitives are declared
    clib_declared: bool,
}

impl IrBuilder {
    /// Create a new IR builder
    pub fn new(module_name: impl Into<String>) -> Self {
        Self {
            next_vreg: 0,
            next_block: 0,
            next_string: 0,
            module: Module::new(module_name),
            current_fn: None,
            current_block: None,
            clib_declared: false,
        }
    }

    /// Finish building and return the module
    pub fn finish(mut self) -> Module {
        self.finish_function();
        self.module
    }

    /// Create a fresh virtual register
    pub fn fresh_vreg(&mut self) -> VReg {
        let vreg = VReg(self.next_vreg);
        self.next_vreg += 1;
        vreg
    }

    /// Create a fresh block ID
    pub fn fresh_block(&mut self) -> BlockId {
        let id = BlockId(self.next_block);
        self.next_block += 1;
        id
    }

    // ============ Function Building ============

    /// Start building a new function and return its parameter registers.
    /// A previous signature-only declaration with the same name is replaced:
    /// the definition takes over the existing handle.
    pub fn start_function(
        &mut self,
        name: impl Into<String>,
        params: Vec<IrType>,
        ret_type: IrType,
    ) -> Vec<VReg> {
        self.finish_function();

        let name = name.into();
        self.module
            .functions
            .retain(|f| !(f.is_external && f.name == name));

        let param_vregs: Vec<(VReg, IrType)> = params
            .into_iter()
            .map(|ty| (self.fresh_vreg(), ty))
            .collect();
        let vregs: Vec<VReg> = param_vregs.iter().map(|(v, _)| *v).collect();

        self.current_fn = Some(Function::new(name, param_vregs, ret_type));

        // Create entry block
        let entry = self.fresh_block();
        self.current_block = Some(BasicBlock::new(entry).with_label("entry"));

        vregs
    }

    /// Finish the current function
    pub fn finish_function(&mut self) {
        if let Some(block) = self.current_block.take() {
            if let Some(ref mut func) = self.current_fn {
                func.blocks.push(block);
            }
        }
        if let Some(func) = self.current_fn.take() {
            self.module.functions.push(func);
        }
    }

    /// Declare an external function
    pub fn declare_external(&mut self, name: impl Into<String>, params: Vec<IrType>, ret_type: IrType) {
        let mut func = Function::new(name, vec![], ret_type);
        func.is_external = true;
        // Store param types without vregs for external functions
        func.params = params.into_iter().map(|ty| (VReg(0), ty)).collect();
        self.module.functions.push(func);
    }

    /// Declare an external variadic function
    pub fn declare_external_vararg(&mut self, name: impl Into<String>, params: Vec<IrType>, ret_type: IrType) {
        let mut func = Function::new(name, vec![], ret_type);
        func.is_external = true;
        func.is_vararg = true;
        func.params = params.into_iter().map(|ty| (VReg(0), ty)).collect();
        self.module.functions.push(func);
    }

    /// Declare the C library primitives the generated code relies on
    pub fn declare_c_library(&mut self) {
        if self.clib_declared {
            return;
        }
        self.clib_declared = true;

        // int printf(const char *format, ...)
        self.declare_external_vararg("printf", vec![IrType::ptr(IrType::I8)], IrType::I32);

        // int strcmp(const char *s1, const char *s2)
        self.declare_external(
            "strcmp",
            vec![IrType::ptr(IrType::I8), IrType::ptr(IrType::I8)],
            IrType::I32,
        );

        // void *malloc(size_t size)
        self.declare_external("malloc", vec![IrType::I64], IrType::ptr(IrType::I8));
    }

    /// Add a global string constant and return its name
    pub fn add_string_constant(&mut self, value: &str) -> String {
        let name = format!(".str.{}", self.next_string);
        self.next_string += 1;

        self.module.globals.push(Global {
            name: name.clone(),
            ty: IrType::Array(Box::new(IrType::I8), value.len() + 1), // +1 for null terminator
            init: Some(Constant::String(value.to_string())),
            is_const: true,
        });

        name
    }

    /// Emit a global string reference (pointer to the first byte)
    pub fn global_string_ptr(&mut self, global_name: &str) -> VReg {
        self.emit_with_result(InstrKind::GlobalRef(global_name.to_string()))
    }

    /// Record an aggregate layout on the module
    pub fn add_struct_layout(&mut self, layout: StructLayout) {
        self.module.structs.push(layout);
    }

    // ============ Block Building ============

    /// Create a new block and return its ID
    pub fn create_block(&mut self) -> BlockId {
        self.fresh_block()
    }

    /// Start building a block (finishes current block first)
    pub fn start_block(&mut self, id: BlockId) {
        if let Some(block) = self.current_block.take() {
            if let Some(ref mut func) = self.current_fn {
                func.blocks.push(block);
            }
        }
        self.current_block = Some(BasicBlock::new(id));
    }

    /// Get the current block ID
    pub fn current_block_id(&self) -> Option<BlockId> {
        self.current_block.as_ref().map(|b| b.id)
    }

    /// Does the current block already end in a terminator?
    pub fn has_terminator(&self) -> bool {
        self.current_block
            .as_ref()
            .map(|b| b.terminator.is_some())
            .unwrap_or(false)
    }

    // ============ Instruction Emission ============

    fn emit(&mut self, result: Option<VReg>, kind: InstrKind) -> Option<VReg> {
        if let Some(ref mut block) = self.current_block {
            block.instructions.push(Instruction::new(result, kind));
        }
        result
    }

    fn emit_with_result(&mut self, kind: InstrKind) -> VReg {
        let result = self.fresh_vreg();
        self.emit(Some(result), kind);
        result
    }

    // ============ Constants ============

    /// Emit an integer constant
    pub fn const_int(&mut self, value: i64) -> VReg {
        self.emit_with_result(InstrKind::Const(Constant::Int(value)))
    }

    // ============ Arithmetic ============

    pub fn add(&mut self, a: VReg, b: VReg) -> VReg {
        self.emit_with_result(InstrKind::Add(a, b))
    }

    pub fn sub(&mut self, a: VReg, b: VReg) -> VReg {
        self.emit_with_result(InstrKind::Sub(a, b))
    }

    pub fn mul(&mut self, a: VReg, b: VReg) -> VReg {
        self.emit_with_result(InstrKind::Mul(a, b))
    }

    pub fn sdiv(&mut self, a: VReg, b: VReg) -> VReg {
        self.emit_with_result(InstrKind::SDiv(a, b))
    }

    // ============ Bitwise ============

    pub fn and(&mut self, a: VReg, b: VReg) -> VReg {
        self.emit_with_result(InstrKind::And(a, b))
    }

    pub fn or(&mut self, a: VReg, b: VReg) -> VReg {
        self.emit_with_result(InstrKind::Or(a, b))
    }

    pub fn xor(&mut self, a: VReg, b: VReg) -> VReg {
        self.emit_with_result(InstrKind::Xor(a, b))
    }

    pub fn not(&mut self, v: VReg) -> VReg {
        self.emit_with_result(InstrKind::Not(v))
    }

    // ============ Comparison ============

    pub fn icmp(&mut self, op: CmpOp, a: VReg, b: VReg) -> VReg {
        self.emit_with_result(InstrKind::ICmp(op, a, b))
    }

    // ============ Conversions ============

    pub fn sext(&mut self, v: VReg, ty: IrType) -> VReg {
        self.emit_with_result(InstrKind::SExt(v, ty))
    }

    pub fn trunc(&mut self, v: VReg, ty: IrType) -> VReg {
        self.emit_with_result(InstrKind::Trunc(v, ty))
    }

    // ============ Memory ============

    pub fn alloca(&mut self, ty: IrType) -> VReg {
        self.emit_with_result(InstrKind::Alloca(ty))
    }

    /// Allocate memory on the heap (malloc)
    pub fn malloc(&mut self, ty: IrType) -> VReg {
        self.emit_with_result(InstrKind::Malloc(ty))
    }

    pub fn load(&mut self, ptr: VReg) -> VReg {
        self.emit_with_result(InstrKind::Load(ptr))
    }

    pub fn store(&mut self, ptr: VReg, value: VReg) {
        self.emit(None, InstrKind::Store(ptr, value));
    }

    pub fn get_field_ptr(&mut self, ptr: VReg, field_idx: u32) -> VReg {
        self.emit_with_result(InstrKind::GetFieldPtr(ptr, field_idx))
    }

    // ============ Calls ============

    pub fn call(&mut self, func: impl Into<String>, args: Vec<VReg>) -> VReg {
        self.emit_with_result(InstrKind::Call {
            func: func.into(),
            args,
        })
    }

    pub fn call_void(&mut self, func: impl Into<String>, args: Vec<VReg>) {
        self.emit(None, InstrKind::Call {
            func: func.into(),
            args,
        });
    }

    // ============ Terminators ============

    pub fn ret(&mut self, value: Option<VReg>) {
        if let Some(ref mut block) = self.current_block {
            block.terminator = Some(Terminator::Ret(value));
        }
    }

    pub fn br(&mut self, target: BlockId) {
        if let Some(ref mut block) = self.current_block {
            block.terminator = Some(Terminator::Br(target));
        }
    }

    pub fn cond_br(&mut self, cond: VReg, then_block: BlockId, else_block: BlockId) {
        if let Some(ref mut block) = self.current_block {
            block.terminator = Some(Terminator::CondBr {
                cond,
                then_block,
                else_block,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_building() {
        let mut builder = IrBuilder::new("test");
        let params = builder.start_function("one", vec![IrType::I64], IrType::I64);
        assert_eq!(params.len(), 1);
        let value = builder.const_int(1);
        let sum = builder.add(params[0], value);
        builder.ret(Some(sum));
        let module = builder.finish();

        let func = module.get_function("one").expect("function emitted");
        assert!(!func.is_external);
        assert_eq!(func.ret_type, IrType::I64);
        assert_eq!(func.blocks.len(), 1);
        assert_eq!(func.blocks[0].instructions.len(), 2);
        assert!(matches!(
            func.blocks[0].terminator,
            Some(Terminator::Ret(Some(_)))
        ));
    }

    #[test]
    fn test_definition_replaces_external_declaration() {
        let mut builder = IrBuilder::new("test");
        builder.declare_external("helper", vec![IrType::I32], IrType::Void);
        builder.start_function("helper", vec![IrType::I32], IrType::Void);
        builder.ret(None);
        let module = builder.finish();

        let matches: Vec<_> = module
            .functions
            .iter()
            .filter(|f| f.name == "helper")
            .collect();
        assert_eq!(matches.len(), 1);
        assert!(!matches[0].is_external);
    }

    #[test]
    fn test_c_library_declared_once() {
        let mut builder = IrBuilder::new("test");
        builder.declare_c_library();
        builder.declare_c_library();
        let module = builder.finish();
        assert_eq!(
            module.functions.iter().filter(|f| f.name == "printf").count(),
            1
        );
        assert!(module.get_function("printf").unwrap().is_vararg);
        assert!(module.get_function("strcmp").unwrap().is_external);
        assert!(module.get_function("malloc").unwrap().is_external);
    }

    #[test]
    fn test_string_constants_get_unique_names() {
        let mut builder = IrBuilder::new("test");
        let a = builder.add_string_constant("hello");
        let b = builder.add_string_constant("world");
        assert_ne!(a, b);
        let module = builder.finish();
        assert_eq!(module.globals.len(), 2);
        assert_eq!(module.globals[0].ty, IrType::Array(Box::new(IrType::I8), 6));
    }
}
