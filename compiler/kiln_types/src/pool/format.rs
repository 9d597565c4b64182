//! Human-readable type rendering for diagnostics.

use std::fmt::Write;

use kiln_ir::StringInterner;

use crate::{Idx, Pool, RefKind, Tag};

impl Pool {
    /// Render a type as it would be written in source.
    ///
    /// Named types print their name only, so recursive types terminate.
    pub fn format_type(&self, idx: Idx, interner: &StringInterner) -> String {
        let mut out = String::new();
        self.write_type(&mut out, idx, interner);
        out
    }

    fn write_type(&self, out: &mut String, idx: Idx, interner: &StringInterner) {
        if let Some(name) = idx.name() {
            out.push_str(name);
            return;
        }
        let item = self.item(idx);
        match item.tag {
            Tag::Vec => {
                out.push('[');
                self.write_type(out, item.child(), interner);
                out.push(']');
            }
            Tag::Box | Tag::Rc => {
                out.push_str(item.tag.name());
                out.push('<');
                self.write_type(out, item.child(), interner);
                out.push('>');
            }
            Tag::Map => {
                let (key, value) = self.map_entry(idx);
                out.push('{');
                self.write_type(out, key, interner);
                out.push_str(": ");
                self.write_type(out, value, interner);
                out.push('}');
            }
            Tag::Ref => {
                if let Some(r) = self.ref_type(idx) {
                    out.push('&');
                    if r.kind != RefKind::Polymorphic {
                        out.push_str(r.kind.as_str());
                        out.push(' ');
                    }
                    if r.mutability.is_mut() {
                        out.push_str("mut ");
                    }
                    self.write_type(out, r.target, interner);
                }
            }
            Tag::Tuple => {
                out.push('(');
                for (i, elem) in self.tuple_elems(idx).into_iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    self.write_type(out, elem, interner);
                }
                out.push(')');
            }
            Tag::Struct => out.push_str(interner.lookup(self.struct_name(idx))),
            Tag::Enum => out.push_str(interner.lookup(self.enum_name(idx))),
            Tag::Named => out.push_str(interner.lookup(self.named_name(idx))),
            Tag::Continuation => {
                if let Some((handler, op)) = self.continuation_parts(idx) {
                    let _ = write!(out, "cont<h{handler}, {op}>");
                }
            }
            Tag::Int
            | Tag::Float
            | Tag::Bool
            | Tag::Str
            | Tag::Char
            | Tag::Byte
            | Tag::Unit
            | Tag::Never
            | Tag::Error => out.push_str(item.tag.name()),
        }
    }
}
