//! End-to-end tests: build a bytecode function by hand, compile it, call
//! the native entry, and check the resulting objects.

use pyrite_jit::{
    opcodes as op, CallError, FunctionSource, Instruction, JitEngine, JitError, TranslateError,
};
use pyrite_runtime::error::{type_error_type, value_error, value_error_type};
use pyrite_runtime::{repr, Const, ObjRef, OwnedRef, Payload};

fn i(opcode: u8, arg: u32) -> Instruction {
    Instruction::new(opcode, arg)
}

fn engine() -> JitEngine {
    JitEngine::new(0).unwrap()
}

fn source(
    name: &str,
    param_count: usize,
    local_count: usize,
    code: Vec<Instruction>,
    consts: Vec<Const>,
    names: Vec<&str>,
) -> FunctionSource {
    FunctionSource {
        name: name.to_string(),
        param_count,
        local_count,
        code,
        consts,
        names: names.into_iter().map(String::from).collect(),
    }
}

fn int_of(v: &OwnedRef) -> i64 {
    match v.obj().payload {
        Payload::Int(n) => n,
        _ => panic!("expected int, got {}", repr(v.obj())),
    }
}

#[test]
fn arithmetic_on_parameters() {
    let mut engine = engine();
    let src = source(
        "poly",
        2,
        2,
        vec![
            i(op::RESUME, 0),
            i(op::LOAD_FAST, 0),
            i(op::LOAD_FAST, 1),
            i(op::BINARY_OP, 0), // +
            i(op::LOAD_CONST, 0),
            i(op::BINARY_OP, 5), // *
            i(op::RETURN_VALUE, 0),
        ],
        vec![Const::Int(2)],
        vec![],
    );
    engine.compile(&src).unwrap();
    let entry = engine.lookup("poly").unwrap();
    let out = entry.call(&[OwnedRef::int(3), OwnedRef::int(4)]).unwrap();
    assert_eq!(int_of(&out), 14);
}

#[test]
fn return_const_shortcut() {
    let mut engine = engine();
    let src = source(
        "banner",
        0,
        0,
        vec![i(op::RESUME, 0), i(op::RETURN_CONST, 0)],
        vec![Const::Obj(OwnedRef::str("done"))],
        vec![],
    );
    engine.compile(&src).unwrap();
    let out = engine.lookup("banner").unwrap().call(&[]).unwrap();
    assert_eq!(repr(out.obj()), "'done'");
}

#[test]
fn while_loop_sums_below_bound() {
    // total = 0; idx = 0
    // while idx < n: total += idx; idx += 1
    // return total
    let mut engine = engine();
    let src = source(
        "tri",
        1,
        3,
        vec![
            i(op::RESUME, 0),
            i(op::LOAD_CONST, 0),
            i(op::STORE_FAST, 1),
            i(op::LOAD_CONST, 0),
            i(op::STORE_FAST, 2),
            i(op::LOAD_FAST, 2), // 5: loop head
            i(op::LOAD_FAST, 0),
            i(op::COMPARE_OP, 0), // <
            i(op::TO_BOOL, 0),
            i(op::POP_JUMP_IF_FALSE, 9), // -> 19
            i(op::LOAD_FAST, 1),
            i(op::LOAD_FAST, 2),
            i(op::BINARY_OP, 0),
            i(op::STORE_FAST, 1),
            i(op::LOAD_FAST, 2),
            i(op::LOAD_CONST, 1),
            i(op::BINARY_OP, 0),
            i(op::STORE_FAST, 2),
            i(op::JUMP_BACKWARD, 14), // -> 5
            i(op::LOAD_FAST, 1), // 19: exit
            i(op::RETURN_VALUE, 0),
        ],
        vec![Const::Int(0), Const::Int(1)],
        vec![],
    );
    engine.compile(&src).unwrap();
    let out = engine.lookup("tri").unwrap().call(&[OwnedRef::int(5)]).unwrap();
    assert_eq!(int_of(&out), 10);
}

#[test]
fn tuple_preserves_argument_order() {
    let mut engine = engine();
    let src = source(
        "pair",
        2,
        2,
        vec![
            i(op::RESUME, 0),
            i(op::LOAD_FAST_LOAD_FAST, 0x01),
            i(op::BUILD_TUPLE, 2),
            i(op::RETURN_VALUE, 0),
        ],
        vec![],
        vec![],
    );
    engine.compile(&src).unwrap();
    let entry = engine.lookup("pair").unwrap();
    let out = entry.call(&[OwnedRef::int(3), OwnedRef::int(4)]).unwrap();
    assert_eq!(repr(out.obj()), "(3, 4)");
}

#[test]
fn refcounts_balance_across_many_calls() {
    let mut engine = engine();
    let src = source(
        "succ",
        1,
        1,
        vec![
            i(op::RESUME, 0),
            i(op::LOAD_FAST, 0),
            i(op::LOAD_CONST, 0),
            i(op::BINARY_OP, 0),
            i(op::RETURN_VALUE, 0),
        ],
        vec![Const::Int(1)],
        vec![],
    );
    engine.compile(&src).unwrap();
    let entry = engine.lookup("succ").unwrap();

    let arg = OwnedRef::int(100);
    let before = arg.refcount();
    for _ in 0..10_000 {
        let out = entry.call(std::slice::from_ref(&arg)).unwrap();
        assert_eq!(int_of(&out), 101);
    }
    assert_eq!(arg.refcount(), before);
}

#[test]
fn duplicate_names_are_rejected_and_entries_stay_independent() {
    let mut engine = engine();
    let ret_const = |name: &str, value: i64| {
        source(
            name,
            0,
            0,
            vec![i(op::RESUME, 0), i(op::RETURN_CONST, 0)],
            vec![Const::Int(value)],
            vec![],
        )
    };
    engine.compile(&ret_const("first", 1)).unwrap();
    engine.compile(&ret_const("second", 2)).unwrap();

    let err = engine.compile(&ret_const("first", 3)).unwrap_err();
    assert!(matches!(err, JitError::DuplicateName(name) if name == "first"));

    // The failed compile must not disturb what is installed.
    assert_eq!(engine.installed_count(), 2);
    let a = engine.lookup("first").unwrap().call(&[]).unwrap();
    let b = engine.lookup("second").unwrap().call(&[]).unwrap();
    assert_eq!(int_of(&a), 1);
    assert_eq!(int_of(&b), 2);
}

#[test]
fn entry_arity_is_capped() {
    let mut engine = engine();
    let src = source(
        "wide",
        5,
        5,
        vec![i(op::RESUME, 0), i(op::LOAD_FAST, 0), i(op::RETURN_VALUE, 0)],
        vec![],
        vec![],
    );
    let err = engine.compile(&src).unwrap_err();
    assert!(matches!(err, JitError::UnsupportedArity(5)));
}

#[test]
fn wrong_argument_count_is_a_call_error() {
    let mut engine = engine();
    let src = source(
        "one",
        1,
        1,
        vec![i(op::RESUME, 0), i(op::LOAD_FAST, 0), i(op::RETURN_VALUE, 0)],
        vec![],
        vec![],
    );
    engine.compile(&src).unwrap();
    let err = engine.lookup("one").unwrap().call(&[]).unwrap_err();
    assert!(matches!(err, CallError::Arity { expected: 1, got: 0 }));
}

fn twice(args: &[ObjRef], _kwargs: &[(ObjRef, ObjRef)]) -> Result<OwnedRef, OwnedRef> {
    match unsafe { &(*args[0]).payload } {
        Payload::Int(n) => Ok(OwnedRef::int(n * 2)),
        _ => Err(value_error("expected an int")),
    }
}

#[test]
fn calls_a_bound_global_function() {
    let mut engine = engine();
    let src = source(
        "call_twice",
        1,
        1,
        vec![
            i(op::RESUME, 0),
            i(op::LOAD_GLOBAL, 0b1), // name 0, with the null marker
            i(op::LOAD_FAST, 0),
            i(op::CALL, 1),
            i(op::RETURN_VALUE, 0),
        ],
        vec![],
        vec!["twice"],
    );
    engine.compile(&src).unwrap();
    let entry = engine.lookup("call_twice").unwrap();
    entry
        .tables()
        .set_global("twice", OwnedRef::function("twice", twice));
    let out = entry.call(&[OwnedRef::int(21)]).unwrap();
    assert_eq!(int_of(&out), 42);
}

#[test]
fn unbound_global_raises_name_error() {
    let mut engine = engine();
    let src = source(
        "call_missing",
        0,
        0,
        vec![
            i(op::RESUME, 0),
            i(op::LOAD_GLOBAL, 0b1),
            i(op::CALL, 0),
            i(op::RETURN_VALUE, 0),
        ],
        vec![],
        vec!["missing"],
    );
    engine.compile(&src).unwrap();
    let err = engine.lookup("call_missing").unwrap().call(&[]).unwrap_err();
    let CallError::Raised(raised) = err else {
        panic!("expected a raised exception");
    };
    assert!(raised.to_string().contains("name 'missing' is not defined"));
}

fn probe(args: &[ObjRef], kwargs: &[(ObjRef, ObjRef)]) -> Result<OwnedRef, OwnedRef> {
    assert_eq!(args.len(), 1);
    assert_eq!(kwargs.len(), 1);
    let (name, value) = kwargs[0];
    match unsafe { &(*name).payload } {
        Payload::Str(s) => assert_eq!(s, "k"),
        _ => panic!("keyword name must be a string"),
    }
    let (pos, kw) = unsafe {
        match (&(*args[0]).payload, &(*value).payload) {
            (Payload::Int(a), Payload::Int(b)) => (*a, *b),
            _ => panic!("expected int arguments"),
        }
    };
    Ok(OwnedRef::int(pos * 1000 + kw))
}

#[test]
fn call_kw_passes_trailing_arguments_as_keywords() {
    let mut engine = engine();
    let src = source(
        "call_probe",
        0,
        0,
        vec![
            i(op::RESUME, 0),
            i(op::LOAD_GLOBAL, 0b1),
            i(op::LOAD_CONST, 0), // positional 7
            i(op::LOAD_CONST, 1), // keyword value 5
            i(op::LOAD_CONST, 2), // kwnames ("k",)
            i(op::CALL_KW, 2),
            i(op::RETURN_VALUE, 0),
        ],
        vec![
            Const::Int(7),
            Const::Int(5),
            Const::Obj(OwnedRef::tuple(vec![OwnedRef::str("k")])),
        ],
        vec!["probe"],
    );
    engine.compile(&src).unwrap();
    let entry = engine.lookup("call_probe").unwrap();
    entry
        .tables()
        .set_global("probe", OwnedRef::function("probe", probe));
    let out = entry.call(&[]).unwrap();
    assert_eq!(int_of(&out), 7005);
}

#[test]
fn raise_surfaces_as_call_error() {
    let mut engine = engine();
    let src = source(
        "boom",
        0,
        0,
        vec![
            i(op::RESUME, 0),
            i(op::LOAD_CONST, 0),
            i(op::RAISE_VARARGS, 1),
        ],
        vec![Const::Obj(value_error("boom"))],
        vec![],
    );
    engine.compile(&src).unwrap();
    let entry = engine.lookup("boom").unwrap();
    for _ in 0..3 {
        let err = entry.call(&[]).unwrap_err();
        let CallError::Raised(raised) = err else {
            panic!("expected a raised exception");
        };
        assert!(raised.to_string().contains("boom"));
    }
}

#[test]
fn unknown_opcode_fails_translation() {
    let mut engine = engine();
    let src = source(
        "mystery",
        0,
        0,
        vec![i(op::RESUME, 0), i(70, 0), i(op::RETURN_CONST, 0)],
        vec![Const::Int(0)],
        vec![],
    );
    let err = engine.compile(&src).unwrap_err();
    assert!(matches!(
        err,
        JitError::Translate(TranslateError::UnsupportedOpcode { opcode: 70, .. })
    ));
}

#[test]
fn for_loop_sums_a_list() {
    let mut engine = engine();
    let src = source(
        "sum3",
        0,
        1,
        vec![
            i(op::RESUME, 0),
            i(op::LOAD_CONST, 1),
            i(op::STORE_FAST, 0),
            i(op::LOAD_CONST, 0),
            i(op::GET_ITER, 0),
            i(op::FOR_ITER, 4), // 5: exit lands past END_FOR/POP_TOP at 12
            i(op::LOAD_FAST, 0),
            i(op::BINARY_OP, 0),
            i(op::STORE_FAST, 0),
            i(op::JUMP_BACKWARD, 5), // -> 5
            i(op::END_FOR, 0),
            i(op::POP_TOP, 0),
            i(op::LOAD_FAST, 0), // 12
            i(op::RETURN_VALUE, 0),
        ],
        vec![
            Const::Obj(OwnedRef::list(vec![
                OwnedRef::int(1),
                OwnedRef::int(2),
                OwnedRef::int(3),
            ])),
            Const::Int(0),
        ],
        vec![],
    );
    engine.compile(&src).unwrap();
    let out = engine.lookup("sum3").unwrap().call(&[]).unwrap();
    assert_eq!(int_of(&out), 6);
}

#[test]
fn unpack_assigns_first_element_first() {
    let mut engine = engine();
    let src = source(
        "diff",
        0,
        2,
        vec![
            i(op::RESUME, 0),
            i(op::LOAD_CONST, 0),
            i(op::UNPACK_SEQUENCE, 2),
            i(op::STORE_FAST, 0),
            i(op::STORE_FAST, 1),
            i(op::LOAD_FAST_LOAD_FAST, 0x01),
            i(op::BINARY_OP, 10), // -
            i(op::RETURN_VALUE, 0),
        ],
        vec![Const::Obj(OwnedRef::tuple(vec![
            OwnedRef::int(10),
            OwnedRef::int(20),
        ]))],
        vec![],
    );
    engine.compile(&src).unwrap();
    let out = engine.lookup("diff").unwrap().call(&[]).unwrap();
    assert_eq!(int_of(&out), -10);
}

#[test]
fn unpack_length_mismatch_raises() {
    let mut engine = engine();
    let src = source(
        "short",
        0,
        3,
        vec![
            i(op::RESUME, 0),
            i(op::LOAD_CONST, 0),
            i(op::UNPACK_SEQUENCE, 3),
            i(op::STORE_FAST, 0),
            i(op::STORE_FAST, 1),
            i(op::STORE_FAST, 2),
            i(op::RETURN_CONST, 1),
        ],
        vec![
            Const::Obj(OwnedRef::tuple(vec![OwnedRef::int(10), OwnedRef::int(20)])),
            Const::Int(0),
        ],
        vec![],
    );
    engine.compile(&src).unwrap();
    let err = engine.lookup("short").unwrap().call(&[]).unwrap_err();
    let CallError::Raised(raised) = err else {
        panic!("expected a raised exception");
    };
    assert!(raised.to_string().contains("not enough values to unpack"));
}

#[test]
fn none_test_picks_the_branch() {
    let mut engine = engine();
    let src = source(
        "is_none",
        1,
        1,
        vec![
            i(op::RESUME, 0),
            i(op::LOAD_FAST, 0),
            i(op::POP_JUMP_IF_NONE, 1), // -> 4
            i(op::RETURN_CONST, 0),
            i(op::RETURN_CONST, 1), // 4
        ],
        vec![Const::Int(1), Const::Int(0)],
        vec![],
    );
    engine.compile(&src).unwrap();
    let entry = engine.lookup("is_none").unwrap();
    let when_none = entry.call(&[OwnedRef::none()]).unwrap();
    let when_int = entry.call(&[OwnedRef::int(3)]).unwrap();
    assert_eq!(int_of(&when_none), 0);
    assert_eq!(int_of(&when_int), 1);
}

#[test]
fn swap_of_zero_is_rejected() {
    let mut engine = engine();
    let src = source(
        "bad_swap",
        0,
        0,
        vec![
            i(op::RESUME, 0),
            i(op::LOAD_CONST, 0),
            i(op::SWAP, 0),
            i(op::RETURN_CONST, 0),
        ],
        vec![Const::Int(0)],
        vec![],
    );
    let err = engine.compile(&src).unwrap_err();
    assert!(matches!(
        err,
        JitError::Translate(TranslateError::StackUnderflow)
    ));
}

#[test]
fn exc_match_leaves_exception_for_handler() {
    // A hand-built handler: test the class, and on a match hand the
    // exception itself back to the caller.
    let mut engine = engine();
    let handler = |name: &str, class: OwnedRef| {
        source(
            name,
            0,
            0,
            vec![
                i(op::RESUME, 0),
                i(op::LOAD_CONST, 0),
                i(op::PUSH_EXC_INFO, 0), // [prev, exc]
                i(op::LOAD_CONST, 1),
                i(op::CHECK_EXC_MATCH, 0),   // [prev, exc, matched]
                i(op::POP_JUMP_IF_FALSE, 3), // -> 9
                i(op::SWAP, 2),              // [exc, prev]
                i(op::POP_EXCEPT, 0),
                i(op::RETURN_VALUE, 0), // the exception, not the class
                i(op::POP_TOP, 0),      // 9
                i(op::POP_EXCEPT, 0),
                i(op::RETURN_CONST, 2),
            ],
            vec![
                Const::Obj(value_error("boom")),
                Const::Obj(class),
                Const::Int(0),
            ],
            vec![],
        )
    };
    engine.compile(&handler("caught", value_error_type())).unwrap();
    engine.compile(&handler("missed", type_error_type())).unwrap();

    let hit = engine.lookup("caught").unwrap().call(&[]).unwrap();
    assert_eq!(repr(hit.obj()), "ValueError: boom");
    let miss = engine.lookup("missed").unwrap().call(&[]).unwrap();
    assert_eq!(int_of(&miss), 0);
}

#[test]
fn entry_moves_to_another_thread() {
    let mut engine = engine();
    let src = source(
        "succ_far",
        1,
        1,
        vec![
            i(op::RESUME, 0),
            i(op::LOAD_FAST, 0),
            i(op::LOAD_CONST, 0),
            i(op::BINARY_OP, 0),
            i(op::RETURN_VALUE, 0),
        ],
        vec![Const::Int(1)],
        vec![],
    );
    engine.compile(&src).unwrap();
    let entry = engine.lookup("succ_far").unwrap().clone();
    let out = std::thread::spawn(move || {
        entry
            .call(&[OwnedRef::int(41)])
            .map(|v| int_of(&v))
            .map_err(|e| e.to_string())
    })
    .join()
    .unwrap()
    .unwrap();
    assert_eq!(out, 42);
}

#[test]
fn dual_store_writes_top_of_stack_first() {
    let mut engine = engine();
    let src = source(
        "swap_sub",
        2,
        2,
        vec![
            i(op::RESUME, 0),
            i(op::LOAD_FAST_LOAD_FAST, 0x01),
            // slot 0 takes the top (b), slot 1 takes a.
            i(op::STORE_FAST_STORE_FAST, 0x01),
            i(op::LOAD_FAST_LOAD_FAST, 0x01),
            i(op::BINARY_OP, 10), // -
            i(op::RETURN_VALUE, 0),
        ],
        vec![],
        vec![],
    );
    engine.compile(&src).unwrap();
    let entry = engine.lookup("swap_sub").unwrap();
    let out = entry.call(&[OwnedRef::int(7), OwnedRef::int(3)]).unwrap();
    assert_eq!(int_of(&out), -4);
}

#[test]
fn const_key_map_pairs_keys_with_values() {
    let mut engine = engine();
    let src = source(
        "keyed",
        0,
        0,
        vec![
            i(op::RESUME, 0),
            i(op::LOAD_CONST, 1),
            i(op::LOAD_CONST, 2),
            i(op::LOAD_CONST, 0), // keys tuple on top
            i(op::BUILD_CONST_KEY_MAP, 2),
            i(op::LOAD_CONST, 3),
            i(op::BINARY_SUBSCR, 0),
            i(op::RETURN_VALUE, 0),
        ],
        vec![
            Const::Obj(OwnedRef::tuple(vec![
                OwnedRef::str("x"),
                OwnedRef::str("y"),
            ])),
            Const::Int(1),
            Const::Int(2),
            Const::Obj(OwnedRef::str("y")),
        ],
        vec![],
    );
    engine.compile(&src).unwrap();
    let out = engine.lookup("keyed").unwrap().call(&[]).unwrap();
    assert_eq!(int_of(&out), 2);
}

#[test]
fn map_build_and_subscript() {
    let mut engine = engine();
    let src = source(
        "pick",
        0,
        0,
        vec![
            i(op::RESUME, 0),
            i(op::LOAD_CONST, 0),
            i(op::LOAD_CONST, 1),
            i(op::LOAD_CONST, 2),
            i(op::LOAD_CONST, 3),
            i(op::BUILD_MAP, 2),
            i(op::LOAD_CONST, 0),
            i(op::BINARY_SUBSCR, 0),
            i(op::RETURN_VALUE, 0),
        ],
        vec![
            Const::Obj(OwnedRef::str("x")),
            Const::Int(1),
            Const::Obj(OwnedRef::str("y")),
            Const::Int(2),
        ],
        vec![],
    );
    engine.compile(&src).unwrap();
    let out = engine.lookup("pick").unwrap().call(&[]).unwrap();
    assert_eq!(int_of(&out), 1);
}
