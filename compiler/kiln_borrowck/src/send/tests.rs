use kiln_ir::Name;
use kiln_types::{Idx, Mutability, Pool, RefKind};

use super::SendAnalyzer;

#[test]
fn rc_is_not_send() {
    let mut pool = Pool::new();
    let rc = pool.rc(Idx::INT);
    let v = pool.vec(rc);
    let boxed = pool.boxed(Idx::STR);
    let sends = SendAnalyzer::new(&pool);
    assert!(!sends.is_send(rc));
    assert!(!sends.is_send(v));
    assert!(sends.is_send(boxed));
}

#[test]
fn aliased_mutable_references_are_not_send() {
    let mut pool = Pool::new();
    let shared_mut = pool.reference(RefKind::Shared, Mutability::Mut, Idx::INT);
    let poly_mut = pool.reference(RefKind::Polymorphic, Mutability::Mut, Idx::INT);
    let own_mut = pool.reference(RefKind::Own, Mutability::Mut, Idx::INT);
    let shared_imm = pool.reference(RefKind::Shared, Mutability::Imm, Idx::INT);
    let sends = SendAnalyzer::new(&pool);
    assert!(!sends.is_send(shared_mut));
    assert!(!sends.is_send(poly_mut));
    assert!(sends.is_send(own_mut));
    assert!(sends.is_send(shared_imm));
}

#[test]
fn aggregates_require_all_parts() {
    let mut pool = Pool::new();
    let rc = pool.rc(Idx::INT);
    let pair = pool.tuple(&[Idx::INT, rc]);
    let plain = pool.struct_type(Name::from_raw(1), &[(Name::from_raw(2), Idx::STR)]);
    let sends = SendAnalyzer::new(&pool);
    assert!(!sends.is_send(pair));
    assert!(sends.is_send(plain));
}

#[test]
fn recursive_types_terminate() {
    let mut pool = Pool::new();
    let list = pool.named(Name::from_raw(1));
    let tail = pool.boxed(list);
    let body = pool.enum_type(
        Name::from_raw(1),
        &[
            (Name::from_raw(2), vec![]),
            (Name::from_raw(3), vec![Idx::INT, tail]),
        ],
    );
    pool.define(list, body);
    let sends = SendAnalyzer::new(&pool);
    assert!(sends.is_send(list));
}
