//! The nominal type table of a compilation unit, and its (64-bit, natural alignment) data layout.
//!
//! Types are compared by identity ([`TypeId`]). Non-struct types are interned, so structurally
//! equal non-struct types share an identity; structs are nominal, identified by their name.

use crate::containers::unordered::UnorderedMap;

/// Identity of a type within a [`TypeTable`]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(usize);

impl std::fmt::Debug for TypeId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "ty{}", self.0)
    }
}

/// A type in the program representation
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum Type {
    Void,
    /// An integer of the given bit width
    Int { bits: u32 },
    /// A typed pointer
    Pointer { pointee: TypeId },
    /// A function signature. Only ever used behind a pointer, or as the type of a function.
    Function { ret: TypeId, params: Vec<TypeId> },
    /// A named struct. A `body` of `None` is an opaque (incomplete) struct.
    Struct {
        name: String,
        body: Option<Vec<TypeId>>,
    },
    /// A fixed-size array
    Array { element: TypeId, count: u64 },
}

/// All types known to a compilation unit
#[derive(Clone)]
pub struct TypeTable {
    types: Vec<Type>,
    interned: UnorderedMap<Type, TypeId>,
    structs: UnorderedMap<String, TypeId>,
}

/// Size of a pointer, in bytes
pub const POINTER_SIZE: u64 = 8;

impl TypeTable {
    /// A new table, holding no types
    pub fn new() -> Self {
        Self {
            types: vec![],
            interned: Default::default(),
            structs: Default::default(),
        }
    }

    fn intern(&mut self, t: Type) -> TypeId {
        debug_assert!(!matches!(t, Type::Struct { .. }));
        if let Some(&id) = self.interned.get(&t) {
            return id;
        }
        let id = TypeId(self.types.len());
        self.types.push(t.clone());
        self.interned.insert(t, id);
        id
    }

    pub fn void(&mut self) -> TypeId {
        self.intern(Type::Void)
    }

    pub fn int(&mut self, bits: u32) -> TypeId {
        assert!(bits > 0, "Zero-width integers are not supported");
        self.intern(Type::Int { bits })
    }

    pub fn i1(&mut self) -> TypeId {
        self.int(1)
    }

    pub fn i8(&mut self) -> TypeId {
        self.int(8)
    }

    pub fn i32(&mut self) -> TypeId {
        self.int(32)
    }

    pub fn i64(&mut self) -> TypeId {
        self.int(64)
    }

    pub fn ptr(&mut self, pointee: TypeId) -> TypeId {
        self.intern(Type::Pointer { pointee })
    }

    pub fn func(&mut self, ret: TypeId, params: Vec<TypeId>) -> TypeId {
        self.intern(Type::Function { ret, params })
    }

    /// A pointer to a function of the given signature
    pub fn func_ptr(&mut self, ret: TypeId, params: Vec<TypeId>) -> TypeId {
        let f = self.func(ret, params);
        self.ptr(f)
    }

    pub fn array(&mut self, element: TypeId, count: u64) -> TypeId {
        self.intern(Type::Array { element, count })
    }

    /// Get the struct named `name`, declaring it (as opaque) if it does not exist yet.
    pub fn declare_struct(&mut self, name: &str) -> TypeId {
        if let Some(&id) = self.structs.get(name) {
            return id;
        }
        let id = TypeId(self.types.len());
        self.types.push(Type::Struct {
            name: name.to_owned(),
            body: None,
        });
        self.structs.insert(name.to_owned(), id);
        id
    }

    /// Give the (previously opaque) struct `id` its ordered fields.
    pub fn set_struct_body(&mut self, id: TypeId, fields: Vec<TypeId>) {
        match &mut self.types[id.0] {
            Type::Struct { body, name } => {
                assert!(body.is_none(), "Body of struct {} set twice", name);
                *body = Some(fields);
            }
            t => panic!("Expected a struct type, got {:?}", t),
        }
    }

    /// Declare and define a struct in one step
    pub fn define_struct(&mut self, name: &str, fields: Vec<TypeId>) -> TypeId {
        let id = self.declare_struct(name);
        self.set_struct_body(id, fields);
        id
    }

    pub fn struct_named(&self, name: &str) -> Option<TypeId> {
        self.structs.get(name).cloned()
    }

    /// All struct types, in declaration order
    pub fn structs(&self) -> impl Iterator<Item = TypeId> + '_ {
        self.types
            .iter()
            .enumerate()
            .filter(|(_, t)| matches!(t, Type::Struct { .. }))
            .map(|(i, _)| TypeId(i))
    }

    pub fn get(&self, id: TypeId) -> &Type {
        &self.types[id.0]
    }

    pub fn pointee(&self, id: TypeId) -> Option<TypeId> {
        match self.get(id) {
            Type::Pointer { pointee } => Some(*pointee),
            _ => None,
        }
    }

    pub fn is_pointer(&self, id: TypeId) -> bool {
        matches!(self.get(id), Type::Pointer { .. })
    }

    pub fn is_int(&self, id: TypeId, bits: u32) -> bool {
        matches!(self.get(id), Type::Int { bits: b } if *b == bits)
    }

    /// Is `id` statically a function pointer?
    pub fn is_func_ptr(&self, id: TypeId) -> bool {
        match self.pointee(id) {
            Some(p) => matches!(self.get(p), Type::Function { .. }),
            None => false,
        }
    }

    /// Is `id` statically a pointer to a function pointer?
    pub fn is_ptr_to_func_ptr(&self, id: TypeId) -> bool {
        match self.pointee(id) {
            Some(p) => self.is_func_ptr(p),
            None => false,
        }
    }

    pub fn is_struct(&self, id: TypeId) -> bool {
        matches!(self.get(id), Type::Struct { .. })
    }

    pub fn struct_name(&self, id: TypeId) -> Option<&str> {
        match self.get(id) {
            Type::Struct { name, .. } => Some(name),
            _ => None,
        }
    }

    /// The fields of a struct, or `None` if not a struct or opaque
    pub fn struct_fields(&self, id: TypeId) -> Option<&[TypeId]> {
        match self.get(id) {
            Type::Struct { body: Some(b), .. } => Some(b),
            _ => None,
        }
    }

    /// Return type and parameters of a function type, or of a pointer to one
    pub fn signature(&self, id: TypeId) -> Option<(TypeId, &[TypeId])> {
        let id = self.pointee(id).unwrap_or(id);
        match self.get(id) {
            Type::Function { ret, params } => Some((*ret, params)),
            _ => None,
        }
    }

    /// Size (in bytes) of a value of type `id`, or `None` if it has no size (void, functions,
    /// opaque structs, and any aggregate containing one of those).
    pub fn size_of(&self, id: TypeId) -> Option<u64> {
        self.size_align(id, &mut vec![]).map(|(s, _)| s)
    }

    pub fn align_of(&self, id: TypeId) -> Option<u64> {
        self.size_align(id, &mut vec![]).map(|(_, a)| a)
    }

    /// Is this a value exactly 64 bits wide?
    pub fn is_8byte(&self, id: TypeId) -> bool {
        self.size_of(id) == Some(8)
    }

    fn size_align(&self, id: TypeId, visiting: &mut Vec<TypeId>) -> Option<(u64, u64)> {
        match self.get(id) {
            Type::Void | Type::Function { .. } => None,
            Type::Int { bits } => {
                let bytes = ((*bits as u64) + 7) / 8;
                let bytes = bytes.next_power_of_two();
                Some((bytes, bytes.min(16)))
            }
            Type::Pointer { .. } => Some((POINTER_SIZE, POINTER_SIZE)),
            Type::Array { element, count } => {
                let (s, a) = self.size_align(*element, visiting)?;
                Some((s * count, a))
            }
            Type::Struct { body: None, .. } => None,
            Type::Struct { body: Some(fields), .. } => {
                if visiting.contains(&id) {
                    // A struct containing itself by value has no finite layout
                    return None;
                }
                visiting.push(id);
                let mut offset = 0;
                let mut align = 1;
                let mut res = Some(());
                for &f in fields {
                    match self.size_align(f, visiting) {
                        Some((fs, fa)) => {
                            offset = round_up(offset, fa) + fs;
                            align = align.max(fa);
                        }
                        None => {
                            res = None;
                            break;
                        }
                    }
                }
                visiting.pop();
                res.map(|()| (round_up(offset, align), align))
            }
        }
    }

    /// Byte offset of field `idx` within struct `id`. Panics if `id` is not a struct with a
    /// complete layout.
    pub fn field_offset(&self, id: TypeId, idx: usize) -> u64 {
        let fields = self
            .struct_fields(id)
            .unwrap_or_else(|| panic!("Field offset requested for non-struct {:?}", self.get(id)));
        assert!(idx < fields.len(), "Field {} out of range for {}", idx, self.name(id));
        let mut offset = 0;
        for (i, &f) in fields.iter().enumerate() {
            let (fs, fa) = self
                .size_align(f, &mut vec![id])
                .unwrap_or_else(|| panic!("Field {} of {} has no layout", i, self.name(id)));
            offset = round_up(offset, fa);
            if i == idx {
                return offset;
            }
            offset += fs;
        }
        unreachable!()
    }

    /// A printable name for the type, in the textual program syntax
    pub fn name(&self, id: TypeId) -> String {
        match self.get(id) {
            Type::Void => "void".into(),
            Type::Int { bits } => format!("i{}", bits),
            Type::Pointer { pointee } => format!("ptr<{}>", self.name(*pointee)),
            Type::Function { ret, params } => format!(
                "fn({}) -> {}",
                params
                    .iter()
                    .map(|&p| self.name(p))
                    .collect::<Vec<_>>()
                    .join(", "),
                self.name(*ret)
            ),
            Type::Struct { name, .. } => format!("%{}", name),
            Type::Array { element, count } => format!("[{} x {}]", count, self.name(*element)),
        }
    }
}

impl Default for TypeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TypeTable {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_map()
            .entries(
                self.types
                    .iter()
                    .enumerate()
                    .map(|(i, _)| (TypeId(i), self.name(TypeId(i)))),
            )
            .finish()
    }
}

fn round_up(v: u64, align: u64) -> u64 {
    (v + align - 1) / align * align
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn natural_layout_of_structs_and_arrays() {
        let mut t = TypeTable::new();
        let i32_ = t.i32();
        let i8_ = t.i8();
        let void = t.void();
        let i64_ = t.i64();
        let fp = t.func_ptr(void, vec![i64_]);
        let arr = t.array(i32_, 2);
        let s = t.define_struct("struct.mixed", vec![i32_, fp, arr, i8_]);

        assert_eq!(t.field_offset(s, 0), 0);
        assert_eq!(t.field_offset(s, 1), 8);
        assert_eq!(t.field_offset(s, 2), 16);
        assert_eq!(t.field_offset(s, 3), 24);
        assert_eq!(t.size_of(s), Some(32));
        assert_eq!(t.align_of(s), Some(8));
        assert!(t.is_func_ptr(fp));
        assert!(!t.is_func_ptr(i64_));
        assert!(t.is_8byte(fp));
        assert_eq!(t.name(fp), "ptr<fn(i64) -> void>");
    }

    #[test]
    fn identity_of_types() {
        let mut t = TypeTable::new();
        let a = t.i64();
        let b = t.i64();
        assert_eq!(a, b);
        let p1 = t.ptr(a);
        let p2 = t.ptr(b);
        assert_eq!(p1, p2);
        // Structs are nominal: same body, different identity
        let s1 = t.define_struct("struct.a", vec![a]);
        let s2 = t.define_struct("struct.b", vec![a]);
        assert_ne!(s1, s2);
        assert_eq!(t.declare_struct("struct.a"), s1);
    }

    #[test]
    fn opaque_structs_have_no_size() {
        let mut t = TypeTable::new();
        let o = t.declare_struct("struct.opaque");
        assert_eq!(t.size_of(o), None);
        let arr = t.array(o, 4);
        assert_eq!(t.size_of(arr), None);
        let p = t.ptr(o);
        assert_eq!(t.size_of(p), Some(8));
    }
}
