use std::fmt::Display;

use crate::{DbError, DbResult, Plan, Schema, RID};

/// A typed value stored in a field
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Constant {
    Int(i32),
    String(String),
}

impl Constant {
    pub fn as_int(&self) -> DbResult<i32> {
        match self {
            Constant::Int(n) => Ok(*n),
            Constant::String(s) => Err(DbError::SchemaViolation(format!(
                "expected an int, found '{s}'"
            ))),
        }
    }

    pub fn as_str(&self) -> DbResult<&str> {
        match self {
            Constant::String(s) => Ok(s),
            Constant::Int(n) => Err(DbError::SchemaViolation(format!(
                "expected a string, found {n}"
            ))),
        }
    }
}

/// Renders as SQL literal text so predicates and view definitions read back through the parser
impl Display for Constant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Constant::Int(n) => write!(f, "{n}"),
            Constant::String(s) => write!(f, "'{s}'"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Constant(Constant),
    Field(String),
}

impl Expression {
    pub fn evaluate(&self, scan: &dyn Scan) -> DbResult<Constant> {
        match self {
            Expression::Constant(value) => Ok(value.clone()),
            Expression::Field(name) => scan.get_value(name),
        }
    }

    pub fn as_field_name(&self) -> Option<&str> {
        match self {
            Expression::Field(name) => Some(name),
            Expression::Constant(_) => None,
        }
    }

    pub fn as_constant(&self) -> Option<&Constant> {
        match self {
            Expression::Constant(value) => Some(value),
            Expression::Field(_) => None,
        }
    }

    pub fn applies_to(&self, schema: &Schema) -> bool {
        match self {
            Expression::Constant(_) => true,
            Expression::Field(name) => schema.has_field(name),
        }
    }
}

impl Display for Expression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Expression::Constant(value) => write!(f, "{value}"),
            Expression::Field(name) => write!(f, "{name}"),
        }
    }
}

/// An equality between two expressions
#[derive(Debug, Clone, PartialEq)]
pub struct Term {
    pub lhs: Expression,
    pub rhs: Expression,
}

impl Term {
    pub fn new(lhs: Expression, rhs: Expression) -> Self {
        Self { lhs, rhs }
    }

    pub fn is_satisfied(&self, scan: &dyn Scan) -> DbResult<bool> {
        Ok(self.lhs.evaluate(scan)? == self.rhs.evaluate(scan)?)
    }

    /// How much this term is expected to shrink the output of `plan`
    pub fn reduction_factor(&self, plan: &dyn Plan) -> usize {
        match (&self.lhs, &self.rhs) {
            (Expression::Field(l), Expression::Field(r)) => {
                plan.distinct_values(l).max(plan.distinct_values(r))
            }
            (Expression::Field(l), Expression::Constant(_)) => plan.distinct_values(l),
            (Expression::Constant(_), Expression::Field(r)) => plan.distinct_values(r),
            (Expression::Constant(l), Expression::Constant(r)) => {
                if l == r {
                    1
                } else {
                    usize::MAX
                }
            }
        }
    }

    /// The constant this term pins `field_name` to, if it has the form `field = constant`
    pub fn equates_with_constant(&self, field_name: &str) -> Option<&Constant> {
        match (&self.lhs, &self.rhs) {
            (Expression::Field(f), Expression::Constant(c))
            | (Expression::Constant(c), Expression::Field(f))
                if f == field_name =>
            {
                Some(c)
            }
            _ => None,
        }
    }

    /// The other field this term equates `field_name` with, if it has the form `field = field`
    pub fn equates_with_field(&self, field_name: &str) -> Option<&str> {
        match (&self.lhs, &self.rhs) {
            (Expression::Field(l), Expression::Field(r)) if l == field_name => Some(r),
            (Expression::Field(l), Expression::Field(r)) if r == field_name => Some(l),
            _ => None,
        }
    }

    pub fn applies_to(&self, schema: &Schema) -> bool {
        self.lhs.applies_to(schema) && self.rhs.applies_to(schema)
    }
}

impl Display for Term {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} = {}", self.lhs, self.rhs)
    }
}

/// A conjunction of terms; the empty predicate is always satisfied
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Predicate {
    terms: Vec<Term>,
}

impl Predicate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_term(term: Term) -> Self {
        Self { terms: vec![term] }
    }

    pub fn terms(&self) -> &[Term] {
        &self.terms
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn conjoin_with(&mut self, other: Predicate) {
        self.terms.extend(other.terms);
    }

    pub fn is_satisfied(&self, scan: &dyn Scan) -> DbResult<bool> {
        for term in &self.terms {
            if !term.is_satisfied(scan)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn reduction_factor(&self, plan: &dyn Plan) -> usize {
        self.terms
            .iter()
            .fold(1usize, |factor, term| {
                factor.saturating_mul(term.reduction_factor(plan))
            })
    }

    /// The terms that only mention fields of `schema`
    pub fn select_sub_pred(&self, schema: &Schema) -> Option<Predicate> {
        let terms: Vec<Term> = self
            .terms
            .iter()
            .filter(|term| term.applies_to(schema))
            .cloned()
            .collect();
        (!terms.is_empty()).then_some(Predicate { terms })
    }

    /// The terms that need both schemas, and neither one alone
    pub fn join_sub_pred(&self, schema1: &Schema, schema2: &Schema) -> Option<Predicate> {
        let mut combined = schema1.clone();
        // a field present in both schemas is already in `combined`
        for field in &schema2.fields {
            if !combined.has_field(field) {
                combined.add_field(
                    field,
                    schema2.info[field].field_type,
                    schema2.info[field].length,
                );
            }
        }
        let terms: Vec<Term> = self
            .terms
            .iter()
            .filter(|term| {
                !term.applies_to(schema1) && !term.applies_to(schema2) && term.applies_to(&combined)
            })
            .cloned()
            .collect();
        (!terms.is_empty()).then_some(Predicate { terms })
    }

    pub fn equates_with_constant(&self, field_name: &str) -> Option<&Constant> {
        self.terms
            .iter()
            .find_map(|term| term.equates_with_constant(field_name))
    }

    pub fn equates_with_field(&self, field_name: &str) -> Option<&str> {
        self.terms
            .iter()
            .find_map(|term| term.equates_with_field(field_name))
    }
}

impl Display for Predicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let terms: Vec<String> = self.terms.iter().map(|t| t.to_string()).collect();
        write!(f, "{}", terms.join(" and "))
    }
}

/// A stateful cursor over records, positioned before the first one when opened
pub trait Scan {
    fn before_first(&mut self) -> DbResult<()>;
    fn next(&mut self) -> DbResult<bool>;
    fn get_int(&self, field_name: &str) -> DbResult<i32>;
    fn get_string(&self, field_name: &str) -> DbResult<String>;
    fn get_value(&self, field_name: &str) -> DbResult<Constant>;
    fn has_field(&self, field_name: &str) -> bool;
    /// Release every pin the scan holds; the scan must not be used afterwards
    fn close(&mut self);
}

/// A scan whose current record can be modified in place
pub trait UpdateScan: Scan {
    fn set_int(&mut self, field_name: &str, value: i32) -> DbResult<()>;
    fn set_string(&mut self, field_name: &str, value: &str) -> DbResult<()>;
    fn set_value(&mut self, field_name: &str, value: &Constant) -> DbResult<()>;
    fn insert(&mut self) -> DbResult<()>;
    fn delete(&mut self) -> DbResult<()>;
    fn get_rid(&self) -> RID;
    fn move_to_rid(&mut self, rid: RID) -> DbResult<()>;
}

impl Scan for Box<dyn Scan> {
    fn before_first(&mut self) -> DbResult<()> {
        (**self).before_first()
    }

    fn next(&mut self) -> DbResult<bool> {
        (**self).next()
    }

    fn get_int(&self, field_name: &str) -> DbResult<i32> {
        (**self).get_int(field_name)
    }

    fn get_string(&self, field_name: &str) -> DbResult<String> {
        (**self).get_string(field_name)
    }

    fn get_value(&self, field_name: &str) -> DbResult<Constant> {
        (**self).get_value(field_name)
    }

    fn has_field(&self, field_name: &str) -> bool {
        (**self).has_field(field_name)
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// Filters its input by a predicate
/// Wrapping an updatable scan yields an updatable scan, which is how update statements find their rows
pub struct SelectScan<S> {
    scan: S,
    predicate: Predicate,
}

impl<S: Scan> SelectScan<S> {
    pub fn new(scan: S, predicate: Predicate) -> Self {
        Self { scan, predicate }
    }
}

impl<S: Scan> Scan for SelectScan<S> {
    fn before_first(&mut self) -> DbResult<()> {
        self.scan.before_first()
    }

    fn next(&mut self) -> DbResult<bool> {
        while self.scan.next()? {
            if self.predicate.is_satisfied(&self.scan)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn get_int(&self, field_name: &str) -> DbResult<i32> {
        self.scan.get_int(field_name)
    }

    fn get_string(&self, field_name: &str) -> DbResult<String> {
        self.scan.get_string(field_name)
    }

    fn get_value(&self, field_name: &str) -> DbResult<Constant> {
        self.scan.get_value(field_name)
    }

    fn has_field(&self, field_name: &str) -> bool {
        self.scan.has_field(field_name)
    }

    fn close(&mut self) {
        self.scan.close()
    }
}

impl<S: UpdateScan> UpdateScan for SelectScan<S> {
    fn set_int(&mut self, field_name: &str, value: i32) -> DbResult<()> {
        self.scan.set_int(field_name, value)
    }

    fn set_string(&mut self, field_name: &str, value: &str) -> DbResult<()> {
        self.scan.set_string(field_name, value)
    }

    fn set_value(&mut self, field_name: &str, value: &Constant) -> DbResult<()> {
        self.scan.set_value(field_name, value)
    }

    fn insert(&mut self) -> DbResult<()> {
        self.scan.insert()
    }

    fn delete(&mut self) -> DbResult<()> {
        self.scan.delete()
    }

    fn get_rid(&self) -> RID {
        self.scan.get_rid()
    }

    fn move_to_rid(&mut self, rid: RID) -> DbResult<()> {
        self.scan.move_to_rid(rid)
    }
}

/// Restricts its input to a list of fields
pub struct ProjectScan {
    scan: Box<dyn Scan>,
    fields: Vec<String>,
}

impl ProjectScan {
    pub fn new(scan: Box<dyn Scan>, fields: Vec<String>) -> Self {
        Self { scan, fields }
    }

    fn check(&self, field_name: &str) -> DbResult<()> {
        if self.has_field(field_name) {
            Ok(())
        } else {
            Err(DbError::SchemaViolation(format!(
                "field {field_name} is not in the projection"
            )))
        }
    }
}

impl Scan for ProjectScan {
    fn before_first(&mut self) -> DbResult<()> {
        self.scan.before_first()
    }

    fn next(&mut self) -> DbResult<bool> {
        self.scan.next()
    }

    fn get_int(&self, field_name: &str) -> DbResult<i32> {
        self.check(field_name)?;
        self.scan.get_int(field_name)
    }

    fn get_string(&self, field_name: &str) -> DbResult<String> {
        self.check(field_name)?;
        self.scan.get_string(field_name)
    }

    fn get_value(&self, field_name: &str) -> DbResult<Constant> {
        self.check(field_name)?;
        self.scan.get_value(field_name)
    }

    fn has_field(&self, field_name: &str) -> bool {
        self.fields.iter().any(|f| f == field_name)
    }

    fn close(&mut self) {
        self.scan.close()
    }
}

/// Nested-loop cross product of two scans
pub struct ProductScan {
    s1: Box<dyn Scan>,
    s2: Box<dyn Scan>,
    s1_positioned: bool,
}

impl ProductScan {
    pub fn new(s1: Box<dyn Scan>, s2: Box<dyn Scan>) -> DbResult<Self> {
        let mut scan = Self {
            s1,
            s2,
            s1_positioned: false,
        };
        scan.before_first()?;
        Ok(scan)
    }
}

impl Scan for ProductScan {
    fn before_first(&mut self) -> DbResult<()> {
        self.s1.before_first()?;
        self.s1_positioned = self.s1.next()?;
        self.s2.before_first()
    }

    fn next(&mut self) -> DbResult<bool> {
        if !self.s1_positioned {
            return Ok(false);
        }
        if self.s2.next()? {
            return Ok(true);
        }
        self.s2.before_first()?;
        if !self.s2.next()? {
            return Ok(false);
        }
        self.s1_positioned = self.s1.next()?;
        Ok(self.s1_positioned)
    }

    fn get_int(&self, field_name: &str) -> DbResult<i32> {
        if self.s1.has_field(field_name) {
            self.s1.get_int(field_name)
        } else {
            self.s2.get_int(field_name)
        }
    }

    fn get_string(&self, field_name: &str) -> DbResult<String> {
        if self.s1.has_field(field_name) {
            self.s1.get_string(field_name)
        } else {
            self.s2.get_string(field_name)
        }
    }

    fn get_value(&self, field_name: &str) -> DbResult<Constant> {
        if self.s1.has_field(field_name) {
            self.s1.get_value(field_name)
        } else {
            self.s2.get_value(field_name)
        }
    }

    fn has_field(&self, field_name: &str) -> bool {
        self.s1.has_field(field_name) || self.s2.has_field(field_name)
    }

    fn close(&mut self) {
        self.s1.close();
        self.s2.close();
    }
}


#[cfg(test)]
mod scan_tests {
    use crate::{
        test_utils::generate_filename, Constant, DbError, Expression, Layout, Predicate,
        ProductScan, ProjectScan, Scan, Schema, SelectScan, SimpleDB, TableScan, Term, UpdateScan,
    };

    fn fill(scan: &mut TableScan, field: &str, values: &[i32]) {
        for v in values {
            scan.insert().unwrap();
            scan.set_int(field, *v).unwrap();
        }
    }

    #[test]
    fn test_select_and_project() {
        let (db, _dir) = SimpleDB::new_for_test(400, 8, 1_000);
        let tx = db.new_tx().unwrap();
        let mut schema = Schema::new();
        schema.add_int_field("a");
        schema.add_int_field("b");
        let layout = Layout::new(schema);
        let table = generate_filename();

        let mut scan = TableScan::new(tx.clone(), &table, layout.clone()).unwrap();
        for i in 0..20 {
            scan.insert().unwrap();
            scan.set_int("a", i % 4).unwrap();
            scan.set_int("b", i).unwrap();
        }
        scan.close();

        let predicate = Predicate::from_term(Term::new(
            Expression::Field("a".to_string()),
            Expression::Constant(Constant::Int(2)),
        ));
        let select = SelectScan::new(
            TableScan::new(tx.clone(), &table, layout.clone()).unwrap(),
            predicate,
        );
        let mut project = ProjectScan::new(Box::new(select), vec!["b".to_string()]);
        let mut seen = Vec::new();
        while project.next().unwrap() {
            seen.push(project.get_int("b").unwrap());
            assert!(matches!(
                project.get_int("a"),
                Err(DbError::SchemaViolation(_))
            ));
        }
        assert_eq!(seen, vec![2, 6, 10, 14, 18]);
        project.close();

        //  deleting through a select scan only touches matching rows
        let predicate = Predicate::from_term(Term::new(
            Expression::Field("a".to_string()),
            Expression::Constant(Constant::Int(0)),
        ));
        let mut select = SelectScan::new(
            TableScan::new(tx.clone(), &table, layout.clone()).unwrap(),
            predicate,
        );
        while select.next().unwrap() {
            select.delete().unwrap();
        }
        select.close();

        let mut all = TableScan::new(tx.clone(), &table, layout).unwrap();
        let mut count = 0;
        while all.next().unwrap() {
            assert_ne!(all.get_int("a").unwrap(), 0);
            count += 1;
        }
        assert_eq!(count, 15);
        all.close();
        tx.commit().unwrap();
    }

    #[test]
    fn test_product() {
        let (db, _dir) = SimpleDB::new_for_test(400, 8, 1_000);
        let tx = db.new_tx().unwrap();

        let mut s1 = Schema::new();
        s1.add_int_field("x");
        let mut s2 = Schema::new();
        s2.add_int_field("y");
        let (t1, t2) = (generate_filename(), generate_filename());

        let mut scan = TableScan::new(tx.clone(), &t1, Layout::new(s1.clone())).unwrap();
        fill(&mut scan, "x", &[1, 2, 3]);
        scan.close();
        let mut scan = TableScan::new(tx.clone(), &t2, Layout::new(s2.clone())).unwrap();
        fill(&mut scan, "y", &[10, 20]);
        scan.close();

        let mut product = ProductScan::new(
            Box::new(TableScan::new(tx.clone(), &t1, Layout::new(s1.clone())).unwrap()),
            Box::new(TableScan::new(tx.clone(), &t2, Layout::new(s2.clone())).unwrap()),
        )
        .unwrap();
        let mut pairs = Vec::new();
        while product.next().unwrap() {
            pairs.push((product.get_int("x").unwrap(), product.get_int("y").unwrap()));
        }
        assert_eq!(
            pairs,
            vec![(1, 10), (1, 20), (2, 10), (2, 20), (3, 10), (3, 20)]
        );
        product.close();

        //  an empty left side yields nothing
        let empty = generate_filename();
        let mut product = ProductScan::new(
            Box::new(TableScan::new(tx.clone(), &empty, Layout::new(s1)).unwrap()),
            Box::new(TableScan::new(tx.clone(), &t2, Layout::new(s2)).unwrap()),
        )
        .unwrap();
        assert!(!product.next().unwrap());
        product.close();
        tx.commit().unwrap();
    }
}
