use smallvec::SmallVec;
use std::fmt::{self, Display, Formatter};
use std::ops::Not as OpNot;

#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug, Ord, PartialOrd)]
pub struct NodeId {
    pub idx: usize,
}
impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.idx)
    }
}
#[macro_export]
macro_rules! nid {
    ( $x:expr ) => {{
        $crate::graph::NodeId::new($x)
    }};
}

impl NodeId {
    pub const fn new(idx: usize) -> NodeId {
        NodeId { idx }
    }
}

/// Ternary signal value. `X` is "unassigned/don't-care".
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum Val3 {
    X,
    V0,
    V1,
}
use Val3::*;

impl Val3 {
    pub fn from_bool(b: bool) -> Val3 {
        if b {
            V1
        } else {
            V0
        }
    }

    pub fn to_bool(self) -> Option<bool> {
        match self {
            X => None,
            V0 => Some(false),
            V1 => Some(true),
        }
    }

    pub fn is_fixed(self) -> bool {
        !matches!(self, X)
    }

    pub fn xor(self, other: Val3) -> Val3 {
        match (self, other) {
            (X, _) | (_, X) => X,
            (a, b) => Val3::from_bool(a != b),
        }
    }
}

impl OpNot for Val3 {
    type Output = Val3;
    fn not(self) -> Val3 {
        match self {
            X => X,
            V0 => V1,
            V1 => V0,
        }
    }
}

/// The elementary gate alphabet.
///
/// Anything richer (complex cells, arbitrary expressions) is lowered to
/// these kinds at construction time so that every fault site is a pin of an
/// elementary gate.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum GateKind {
    PrimaryInput,
    PrimaryOutput,
    Buf,
    Not,
    And,
    Nand,
    Or,
    Nor,
    Xor,
    Xnor,
}
use GateKind::*;

impl GateKind {
    /// Controlling input value: the value that alone determines the output.
    /// X for gates that have none.
    pub fn cval(self) -> Val3 {
        match self {
            And | Nand => V0,
            Or | Nor => V1,
            _ => X,
        }
    }

    /// Non-controlling input value, X where cval is X.
    pub fn nval(self) -> Val3 {
        match self {
            And | Nand => V1,
            Or | Nor => V0,
            _ => X,
        }
    }

    pub fn is_negated(self) -> bool {
        matches!(self, Not | Nand | Nor | Xnor)
    }

    pub fn is_input(self) -> bool {
        matches!(self, PrimaryInput)
    }

    pub fn is_output(self) -> bool {
        matches!(self, PrimaryOutput)
    }

    /// Ternary evaluation over the fanin values.
    ///
    /// PrimaryOutput and Buf pass through, Not inverts; the associative
    /// kinds short-circuit on a controlling value before giving up to X.
    pub fn eval(self, ins: &[Val3]) -> Val3 {
        match self {
            PrimaryInput => unreachable!("primary inputs are not evaluated"),
            PrimaryOutput | Buf => ins[0],
            Not => !ins[0],
            And | Nand | Or | Nor => {
                let c = self.cval();
                let mut has_x = false;
                let mut controlled = false;
                for &v in ins {
                    if v == c {
                        controlled = true;
                        break;
                    }
                    if v == X {
                        has_x = true;
                    }
                }
                let base = if controlled {
                    c
                } else if has_x {
                    return X;
                } else {
                    self.nval()
                };
                if self.is_negated() {
                    !base
                } else {
                    base
                }
            }
            Xor | Xnor => {
                let mut acc = V0;
                for &v in ins {
                    acc = acc.xor(v);
                    if acc == X {
                        return X;
                    }
                }
                if self.is_negated() {
                    !acc
                } else {
                    acc
                }
            }
        }
    }
}

impl Display for GateKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            PrimaryInput => "Input",
            PrimaryOutput => "Output",
            Buf => "Buf",
            Not => "Not",
            And => "And",
            Nand => "Nand",
            Or => "Or",
            Nor => "Nor",
            Xor => "Xor",
            Xnor => "Xnor",
        };
        write!(f, "{}", s)
    }
}

pub(super) const NODE_TINYVEC_SIZE: usize = 2;

/// One elementary gate in the arena.
///
/// Fanins are ordered (pin order is load-bearing for fault addressing),
/// fanouts are not. `active`, `act_fanouts` and `imm_dom` are only
/// meaningful under the current activation scope.
#[derive(Debug, Clone)]
pub struct GateNode {
    pub(super) id: NodeId,
    pub(super) kind: GateKind,
    pub(super) name: String,
    pub(super) fanins: SmallVec<[NodeId; NODE_TINYVEC_SIZE]>,
    pub(super) fanouts: SmallVec<[NodeId; NODE_TINYVEC_SIZE]>,
    pub(super) act_fanouts: SmallVec<[NodeId; NODE_TINYVEC_SIZE]>,
    pub(super) level: u32,
    pub(super) active: bool,
    pub(super) imm_dom: Option<NodeId>,
    // Position in the input/output lists; only valid for PI/PO nodes.
    pub(super) input_id: usize,
    pub(super) output_id: usize,
}

impl GateNode {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn kind(&self) -> GateKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fanins(&self) -> &[NodeId] {
        &self.fanins
    }

    pub fn fanouts(&self) -> &[NodeId] {
        &self.fanouts
    }

    pub fn active_fanouts(&self) -> &[NodeId] {
        &self.act_fanouts
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Nearest active node every active path to a primary output must pass
    /// through. None for outputs and for nodes whose fanout paths diverge
    /// to different outputs. Valid only under the current activation.
    pub fn imm_dom(&self) -> Option<NodeId> {
        self.imm_dom
    }

    pub fn is_input(&self) -> bool {
        self.kind.is_input()
    }

    pub fn is_output(&self) -> bool {
        self.kind.is_output()
    }

    /// Index into [GateGraph::input](super::GateGraph::input); panics on
    /// non-PI nodes.
    pub fn input_id(&self) -> usize {
        assert!(self.is_input());
        self.input_id
    }

    /// Index into [GateGraph::output](super::GateGraph::output); panics on
    /// non-PO nodes.
    pub fn output_id(&self) -> usize {
        assert!(self.is_output());
        self.output_id
    }
}
