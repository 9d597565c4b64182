use kiln_ir::Name;
use kiln_types::{Idx, Mutability, Pool, RefKind};

use super::{ShapeAnalyzer, ShapeStability};

fn n(raw: u32) -> Name {
    Name::from_raw(raw)
}

#[test]
fn primitives_except_str_are_stable() {
    let pool = Pool::new();
    let shapes = ShapeAnalyzer::new(&pool);
    for idx in [Idx::INT, Idx::FLOAT, Idx::BOOL, Idx::CHAR, Idx::BYTE, Idx::UNIT] {
        assert_eq!(shapes.stability(idx), ShapeStability::Stable, "{idx:?}");
    }
    assert_eq!(shapes.stability(Idx::STR), ShapeStability::Unstable);
}

#[test]
fn growable_containers_are_unstable() {
    let mut pool = Pool::new();
    let v = pool.vec(Idx::INT);
    let m = pool.map(Idx::INT, Idx::INT);
    let shapes = ShapeAnalyzer::new(&pool);
    assert!(!shapes.is_stable(v));
    assert!(!shapes.is_stable(m));
}

#[test]
fn indirection_is_always_stable() {
    let mut pool = Pool::new();
    let v = pool.vec(Idx::STR);
    let boxed = pool.boxed(v);
    let rc = pool.rc(v);
    let r = pool.reference(RefKind::Own, Mutability::Mut, v);
    let shapes = ShapeAnalyzer::new(&pool);
    assert!(shapes.is_stable(boxed));
    assert!(shapes.is_stable(rc));
    assert!(shapes.is_stable(r));
}

#[test]
fn structs_follow_their_fields() {
    let mut pool = Pool::new();
    let point = pool.struct_type(n(1), &[(n(2), Idx::INT), (n(3), Idx::FLOAT)]);
    let v = pool.vec(Idx::INT);
    let holder = pool.struct_type(n(4), &[(n(5), Idx::INT), (n(6), v)]);
    let boxed_v = pool.boxed(v);
    let indirect = pool.struct_type(n(7), &[(n(8), boxed_v)]);
    let shapes = ShapeAnalyzer::new(&pool);
    assert!(shapes.is_stable(point));
    assert!(!shapes.is_stable(holder));
    assert!(shapes.is_stable(indirect));
}

#[test]
fn enums_with_payload_are_unstable() {
    let mut pool = Pool::new();
    let color = pool.enum_type(n(1), &[(n(2), vec![]), (n(3), vec![])]);
    let opt = pool.enum_type(n(4), &[(n(5), vec![]), (n(6), vec![Idx::INT])]);
    let shapes = ShapeAnalyzer::new(&pool);
    assert!(shapes.is_stable(color));
    assert!(!shapes.is_stable(opt));
}

#[test]
fn recursion_through_box_terminates() {
    // type Tree = Leaf | Node(int, box<Tree>)
    let mut pool = Pool::new();
    let tree = pool.named(n(1));
    let child = pool.boxed(tree);
    let body = pool.enum_type(n(1), &[(n(2), vec![]), (n(3), vec![Idx::INT, child])]);
    pool.define(tree, body);

    let wrapper = pool.struct_type(n(9), &[(n(10), child)]);
    let shapes = ShapeAnalyzer::new(&pool);
    assert!(!shapes.is_stable(tree));
    assert!(shapes.is_stable(wrapper));
}

#[test]
fn unguarded_cycle_is_unstable() {
    // type Loop = struct { next: Loop } (no indirection)
    let mut pool = Pool::new();
    let looped = pool.named(n(1));
    let body = pool.struct_type(n(1), &[(n(2), looped)]);
    pool.define(looped, body);
    let shapes = ShapeAnalyzer::new(&pool);
    assert_eq!(shapes.stability(looped), ShapeStability::Unstable);
}

#[test]
fn undefined_named_type_is_unstable() {
    let mut pool = Pool::new();
    let opaque = pool.named(n(1));
    let shapes = ShapeAnalyzer::new(&pool);
    assert!(!shapes.is_stable(opaque));
}
