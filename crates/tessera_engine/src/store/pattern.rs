//! Triple patterns.

use tessera_error::{Result, TesseraError};

/// One position of a pattern: either a bound encoded resource id or a query
/// variable id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Term {
    Variable(u64),
    Value(u64),
}

impl Term {
    pub fn is_variable(&self) -> bool {
        matches!(self, Term::Variable(_))
    }

    pub fn raw(&self) -> u64 {
        match self {
            Term::Variable(v) | Term::Value(v) => *v,
        }
    }
}

/// Which positions of a pattern are bound. Determines index and prefix
/// selection during lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternKind {
    /// No position bound.
    Unbound = 0,
    /// Subject bound.
    S = 1,
    /// Property bound.
    P = 2,
    /// Object bound.
    O = 3,
    /// Subject and property bound.
    Sp = 4,
    /// Subject and object bound.
    So = 5,
    /// Property and object bound.
    Po = 6,
    /// Fully bound.
    Spo = 7,
}

impl PatternKind {
    pub fn from_wire(value: u32) -> Result<PatternKind> {
        Ok(match value {
            0 => PatternKind::Unbound,
            1 => PatternKind::S,
            2 => PatternKind::P,
            3 => PatternKind::O,
            4 => PatternKind::Sp,
            5 => PatternKind::So,
            6 => PatternKind::Po,
            7 => PatternKind::Spo,
            other => return Err(TesseraError::new(format!("unknown pattern kind: {other}"))),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriplePattern {
    pub subject: Term,
    pub property: Term,
    pub object: Term,
}

impl TriplePattern {
    pub fn new(subject: Term, property: Term, object: Term) -> Self {
        TriplePattern {
            subject,
            property,
            object,
        }
    }

    pub fn kind(&self) -> PatternKind {
        match (
            self.subject.is_variable(),
            self.property.is_variable(),
            self.object.is_variable(),
        ) {
            (true, true, true) => PatternKind::Unbound,
            (false, true, true) => PatternKind::S,
            (true, false, true) => PatternKind::P,
            (true, true, false) => PatternKind::O,
            (false, false, true) => PatternKind::Sp,
            (false, true, false) => PatternKind::So,
            (true, false, false) => PatternKind::Po,
            (false, false, false) => PatternKind::Spo,
        }
    }

    pub fn subject_is_variable(&self) -> bool {
        self.subject.is_variable()
    }

    pub fn property_is_variable(&self) -> bool {
        self.property.is_variable()
    }

    pub fn object_is_variable(&self) -> bool {
        self.object.is_variable()
    }

    /// Variable ids in subject, property, object order. This is the value
    /// slot order of mappings produced for this pattern.
    pub fn variables(&self) -> Vec<u64> {
        let mut vars = Vec::with_capacity(3);
        for term in [self.subject, self.property, self.object] {
            if let Term::Variable(v) = term {
                vars.push(v);
            }
        }
        vars
    }

    /// Reconstruct a pattern from its kind and raw position values.
    pub fn from_wire(kind: PatternKind, s: u64, p: u64, o: u64) -> TriplePattern {
        let (sv, pv, ov) = match kind {
            PatternKind::Unbound => (true, true, true),
            PatternKind::S => (false, true, true),
            PatternKind::P => (true, false, true),
            PatternKind::O => (true, true, false),
            PatternKind::Sp => (false, false, true),
            PatternKind::So => (false, true, false),
            PatternKind::Po => (true, false, false),
            PatternKind::Spo => (false, false, false),
        };
        let term = |is_var: bool, raw: u64| {
            if is_var {
                Term::Variable(raw)
            } else {
                Term::Value(raw)
            }
        };
        TriplePattern::new(term(sv, s), term(pv, p), term(ov, o))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_covers_all_binding_combinations() {
        let v = Term::Variable(1);
        let b = Term::Value(9);
        assert_eq!(PatternKind::Unbound, TriplePattern::new(v, v, v).kind());
        assert_eq!(PatternKind::S, TriplePattern::new(b, v, v).kind());
        assert_eq!(PatternKind::P, TriplePattern::new(v, b, v).kind());
        assert_eq!(PatternKind::O, TriplePattern::new(v, v, b).kind());
        assert_eq!(PatternKind::Sp, TriplePattern::new(b, b, v).kind());
        assert_eq!(PatternKind::So, TriplePattern::new(b, v, b).kind());
        assert_eq!(PatternKind::Po, TriplePattern::new(v, b, b).kind());
        assert_eq!(PatternKind::Spo, TriplePattern::new(b, b, b).kind());
    }

    #[test]
    fn variables_in_position_order() {
        let pattern = TriplePattern::new(Term::Variable(30), Term::Value(2), Term::Variable(10));
        assert_eq!(vec![30, 10], pattern.variables());
    }

    #[test]
    fn wire_round_trip() {
        let pattern = TriplePattern::new(Term::Value(1), Term::Value(2), Term::Variable(7));
        let kind = pattern.kind();
        let rebuilt = TriplePattern::from_wire(
            PatternKind::from_wire(kind as u32).unwrap(),
            pattern.subject.raw(),
            pattern.property.raw(),
            pattern.object.raw(),
        );
        assert_eq!(pattern, rebuilt);
    }
}
