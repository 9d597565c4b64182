//! Place typing.
//!
//! Walks a place's projections over the type pool, recording what each step
//! crosses. Reference kinds gate some crossings: only an owning or stable
//! reference may reach through a pointer wrapper, into a union payload, or
//! into a container element.

use kiln_ir::Span;
use kiln_types::{Idx, Pool, RefType, Tag};
use smallvec::SmallVec;

use crate::error::IrError;
use crate::ir::{Function, Place, Projection};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum Crossing {
    /// Through a reference.
    Reference,
    /// Through a `box` or `rc`.
    Pointer,
    /// Into a union variant's payload.
    Variant,
    /// Into a container element.
    Element,
    /// Into a struct field or tuple element.
    Field,
}

impl Crossing {
    /// Crossings that a mutation elsewhere in the same storage could invalidate.
    pub(crate) fn is_unstable(self) -> bool {
        matches!(self, Crossing::Pointer | Crossing::Variant | Crossing::Element)
    }

    pub(crate) fn describe(self) -> &'static str {
        match self {
            Crossing::Reference => "through a reference",
            Crossing::Pointer => "through a pointer wrapper",
            Crossing::Variant => "into a union variant's payload",
            Crossing::Element => "into a container element",
            Crossing::Field => "into a field",
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct PlaceStep {
    pub crossing: Crossing,
    /// Type reached after this step.
    pub ty: Idx,
    /// For reference crossings, the reference that was crossed.
    pub reference: Option<RefType>,
}

#[derive(Clone, Debug)]
pub(crate) struct PlaceInfo {
    pub steps: SmallVec<[PlaceStep; 4]>,
    /// Type of the whole place.
    pub ty: Idx,
}

impl PlaceInfo {
    /// Index of the last reference crossing: the reference whose capability
    /// governs every later step and the final access.
    pub(crate) fn governing_ref(&self) -> Option<usize> {
        self.steps
            .iter()
            .rposition(|s| s.crossing == Crossing::Reference)
    }

    /// Unstable crossings after step `from` (exclusive), or from the base if `None`.
    pub(crate) fn unstable_after(&self, from: Option<usize>) -> Option<Crossing> {
        let start = from.map_or(0, |i| i + 1);
        self.steps[start..]
            .iter()
            .map(|s| s.crossing)
            .find(|c| c.is_unstable())
    }
}

pub(crate) fn type_place(
    pool: &Pool,
    func: &Function,
    place: &Place,
    span: Span,
) -> Result<PlaceInfo, IrError> {
    let local = func.local(place.base).ok_or(IrError::UnknownVar {
        var: place.base,
        span,
    })?;
    let mut ty = local.ty;
    let mut steps = SmallVec::new();
    for &proj in &place.projections {
        let step = project(pool, ty, proj).ok_or(IrError::BadProjection { span })?;
        ty = step.ty;
        steps.push(step);
    }
    Ok(PlaceInfo { steps, ty })
}

fn project(pool: &Pool, ty: Idx, proj: Projection) -> Option<PlaceStep> {
    let ty = pool.strip_named(ty);
    let tag = pool.tag(ty);
    let step = |crossing, ty| PlaceStep {
        crossing,
        ty,
        reference: None,
    };
    match (proj, tag) {
        (Projection::Deref, Tag::Ref) => {
            let r = pool.ref_type(ty)?;
            Some(PlaceStep {
                crossing: Crossing::Reference,
                ty: r.target,
                reference: Some(r),
            })
        }
        (Projection::Deref, Tag::Box | Tag::Rc) => {
            Some(step(Crossing::Pointer, pool.wrapper_child(ty)))
        }
        (Projection::Field(i), Tag::Struct) => pool
            .struct_fields(ty)
            .get(i as usize)
            .map(|&(_, f)| step(Crossing::Field, f)),
        (Projection::Field(i), Tag::Tuple) => pool
            .tuple_elems(ty)
            .get(i as usize)
            .map(|&e| step(Crossing::Field, e)),
        (Projection::Variant { variant, field }, Tag::Enum) => pool
            .enum_variants(ty)
            .get(variant as usize)
            .and_then(|(_, fields)| fields.get(field as usize))
            .map(|&f| step(Crossing::Variant, f)),
        (Projection::Index, Tag::Vec) => Some(step(Crossing::Element, pool.wrapper_child(ty))),
        (Projection::Index, Tag::Map) => Some(step(Crossing::Element, pool.map_entry(ty).1)),
        (Projection::Index, Tag::Str) => Some(step(Crossing::Element, Idx::CHAR)),
        _ => None,
    }
}

/// Whether values of `ty` carry a reference inline, so copying one copies
/// a borrow. Pointer wrappers count: a box of references still holds them.
pub(crate) fn holds_reference(pool: &Pool, ty: Idx) -> bool {
    let mut seen = Vec::new();
    holds_reference_in(pool, ty, &mut seen)
}

fn holds_reference_in(pool: &Pool, ty: Idx, seen: &mut Vec<Idx>) -> bool {
    if ty.is_primitive() || seen.contains(&ty) {
        return false;
    }
    seen.push(ty);
    match pool.tag(ty) {
        Tag::Ref => true,
        Tag::Vec | Tag::Box | Tag::Rc => holds_reference_in(pool, pool.wrapper_child(ty), seen),
        Tag::Map => {
            let (k, v) = pool.map_entry(ty);
            holds_reference_in(pool, k, seen) || holds_reference_in(pool, v, seen)
        }
        Tag::Tuple => pool
            .tuple_elems(ty)
            .into_iter()
            .any(|e| holds_reference_in(pool, e, seen)),
        Tag::Struct => pool
            .struct_fields(ty)
            .into_iter()
            .any(|(_, f)| holds_reference_in(pool, f, seen)),
        Tag::Enum => pool
            .enum_variants(ty)
            .into_iter()
            .flat_map(|(_, fields)| fields)
            .any(|f| holds_reference_in(pool, f, seen)),
        Tag::Named => pool
            .resolve(ty)
            .is_some_and(|body| holds_reference_in(pool, body, seen)),
        _ => false,
    }
}
