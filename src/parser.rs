use std::{fmt::Display, iter::Peekable, str::Chars};

use crate::{Constant, DbError, DbResult, Expression, Predicate, Schema, Term};

/// A recursive descent parser for the SQL subset the planner understands
pub struct Parser<'a> {
    lexer: Lexer<'a>,
}

impl<'a> Parser<'a> {
    pub fn new(string: &'a str) -> DbResult<Self> {
        Ok(Self {
            lexer: Lexer::new(string)?,
        })
    }

    /// Parse a complete `select` statement
    pub fn parse_query(&mut self) -> DbResult<QueryData> {
        let query = self.query()?;
        self.lexer.eat_end()?;
        Ok(query)
    }

    /// Parse a complete insert, delete, update or create statement
    pub fn parse_update(&mut self) -> DbResult<SQLStatement> {
        let statement = self.update_command()?;
        self.lexer.eat_end()?;
        Ok(statement)
    }

    /// Parse a list of fields from the SQL statement
    /// Each field is just an identifier
    fn field_list(&mut self) -> DbResult<Vec<String>> {
        let mut list = Vec::new();
        list.push(self.lexer.eat_identifier()?);
        while self.lexer.match_delim(',') {
            self.lexer.eat_delim(',')?;
            list.push(self.lexer.eat_identifier()?);
        }
        Ok(list)
    }

    fn constant(&mut self) -> DbResult<Constant> {
        if self.lexer.match_string_constant() {
            return Ok(Constant::String(self.lexer.eat_string_constant()?));
        }
        Ok(Constant::Int(self.lexer.eat_int_constant()?))
    }

    fn constants(&mut self) -> DbResult<Vec<Constant>> {
        let mut const_list = Vec::new();
        const_list.push(self.constant()?);
        while self.lexer.match_delim(',') {
            self.lexer.eat_delim(',')?;
            const_list.push(self.constant()?);
        }
        Ok(const_list)
    }

    fn expression(&mut self) -> DbResult<Expression> {
        if self.lexer.match_identifier() {
            return Ok(Expression::Field(self.lexer.eat_identifier()?));
        }
        Ok(Expression::Constant(self.constant()?))
    }

    fn term(&mut self) -> DbResult<Term> {
        let lhs = self.expression()?;
        self.lexer.eat_delim('=')?;
        let rhs = self.expression()?;
        Ok(Term::new(lhs, rhs))
    }

    fn predicate(&mut self) -> DbResult<Predicate> {
        let mut predicate = Predicate::from_term(self.term()?);
        while self.lexer.match_keyword("and") {
            self.lexer.eat_keyword("and")?;
            predicate.conjoin_with(Predicate::from_term(self.term()?));
        }
        Ok(predicate)
    }

    fn optional_where(&mut self) -> DbResult<Predicate> {
        if self.lexer.match_keyword("where") {
            self.lexer.eat_keyword("where")?;
            return self.predicate();
        }
        Ok(Predicate::new())
    }

    fn query(&mut self) -> DbResult<QueryData> {
        self.lexer.eat_keyword("select")?;
        let fields = self.field_list()?;
        self.lexer.eat_keyword("from")?;
        let tables = self.field_list()?;
        let predicate = self.optional_where()?;
        Ok(QueryData::new(fields, tables, predicate))
    }

    fn update_command(&mut self) -> DbResult<SQLStatement> {
        if self.lexer.match_keyword("insert") {
            Ok(SQLStatement::InsertData(self.insert()?))
        } else if self.lexer.match_keyword("delete") {
            Ok(SQLStatement::DeleteData(self.delete()?))
        } else if self.lexer.match_keyword("update") {
            Ok(SQLStatement::ModifyData(self.modify()?))
        } else {
            self.create()
        }
    }

    fn create(&mut self) -> DbResult<SQLStatement> {
        self.lexer.eat_keyword("create")?;
        if self.lexer.match_keyword("table") {
            Ok(SQLStatement::CreateTableData(self.create_table()?))
        } else if self.lexer.match_keyword("view") {
            Ok(SQLStatement::CreateViewData(self.create_view()?))
        } else if self.lexer.match_keyword("index") {
            Ok(SQLStatement::CreateIndexData(self.create_index()?))
        } else {
            Err(self.lexer.unexpected("table, view or index"))
        }
    }

    fn field_def(&mut self) -> DbResult<Schema> {
        let field_name = self.lexer.eat_identifier()?;
        let mut schema = Schema::new();
        if self.lexer.match_keyword("int") {
            self.lexer.eat_keyword("int")?;
            schema.add_int_field(&field_name);
        } else if self.lexer.match_keyword("varchar") {
            self.lexer.eat_keyword("varchar")?;
            self.lexer.eat_delim('(')?;
            let size = self.lexer.eat_int_constant()?;
            self.lexer.eat_delim(')')?;
            let size = usize::try_from(size).map_err(|_| {
                DbError::BadSyntax(format!("varchar length {size} must not be negative"))
            })?;
            schema.add_string_field(&field_name, size);
        } else {
            return Err(self.lexer.unexpected("int or varchar"));
        }
        Ok(schema)
    }

    fn field_defs(&mut self) -> DbResult<Schema> {
        let mut schema = Schema::new();
        schema.add_all_from_schema(&self.field_def()?)?;
        while self.lexer.match_delim(',') {
            self.lexer.eat_delim(',')?;
            schema.add_all_from_schema(&self.field_def()?)?;
        }
        Ok(schema)
    }

    fn create_table(&mut self) -> DbResult<CreateTableData> {
        self.lexer.eat_keyword("table")?;
        let table_name = self.lexer.eat_identifier()?;
        self.lexer.eat_delim('(')?;
        let schema = self.field_defs()?;
        self.lexer.eat_delim(')')?;
        Ok(CreateTableData::new(table_name, schema))
    }

    fn create_view(&mut self) -> DbResult<CreateViewData> {
        self.lexer.eat_keyword("view")?;
        let view_name = self.lexer.eat_identifier()?;
        self.lexer.eat_keyword("as")?;
        let query_data = self.query()?;
        Ok(CreateViewData::new(view_name, query_data))
    }

    fn create_index(&mut self) -> DbResult<CreateIndexData> {
        self.lexer.eat_keyword("index")?;
        let index_name = self.lexer.eat_identifier()?;
        self.lexer.eat_keyword("on")?;
        let table_name = self.lexer.eat_identifier()?;
        self.lexer.eat_delim('(')?;
        let field_name = self.lexer.eat_identifier()?;
        self.lexer.eat_delim(')')?;
        Ok(CreateIndexData::new(index_name, table_name, field_name))
    }

    fn insert(&mut self) -> DbResult<InsertData> {
        self.lexer.eat_keyword("insert")?;
        self.lexer.eat_keyword("into")?;
        let table_name = self.lexer.eat_identifier()?;
        self.lexer.eat_delim('(')?;
        let fields = self.field_list()?;
        self.lexer.eat_delim(')')?;
        self.lexer.eat_keyword("values")?;
        self.lexer.eat_delim('(')?;
        let values = self.constants()?;
        self.lexer.eat_delim(')')?;
        if fields.len() != values.len() {
            return Err(DbError::BadSyntax(format!(
                "{} fields but {} values",
                fields.len(),
                values.len()
            )));
        }
        Ok(InsertData::new(table_name, fields, values))
    }

    fn delete(&mut self) -> DbResult<DeleteData> {
        self.lexer.eat_keyword("delete")?;
        self.lexer.eat_keyword("from")?;
        let table_name = self.lexer.eat_identifier()?;
        let predicate = self.optional_where()?;
        Ok(DeleteData::new(table_name, predicate))
    }

    fn modify(&mut self) -> DbResult<ModifyData> {
        self.lexer.eat_keyword("update")?;
        let table_name = self.lexer.eat_identifier()?;
        self.lexer.eat_keyword("set")?;
        let field_name = self.lexer.eat_identifier()?;
        self.lexer.eat_delim('=')?;
        let new_value = self.expression()?;
        let predicate = self.optional_where()?;
        Ok(ModifyData::new(table_name, field_name, new_value, predicate))
    }
}

#[derive(Debug)]
pub enum SQLStatement {
    CreateTableData(CreateTableData),
    CreateViewData(CreateViewData),
    CreateIndexData(CreateIndexData),
    InsertData(InsertData),
    DeleteData(DeleteData),
    ModifyData(ModifyData),
}

#[derive(Debug)]
pub struct ModifyData {
    pub table_name: String,
    pub field_name: String,
    pub new_value: Expression,
    pub predicate: Predicate,
}

impl ModifyData {
    fn new(
        table_name: String,
        field_name: String,
        new_value: Expression,
        predicate: Predicate,
    ) -> Self {
        Self {
            table_name,
            field_name,
            new_value,
            predicate,
        }
    }
}

#[derive(Debug)]
pub struct DeleteData {
    pub table_name: String,
    pub predicate: Predicate,
}

impl DeleteData {
    fn new(table_name: String, predicate: Predicate) -> Self {
        Self {
            table_name,
            predicate,
        }
    }
}

#[derive(Debug)]
pub struct InsertData {
    pub table_name: String,
    pub fields: Vec<String>,
    pub values: Vec<Constant>,
}

impl InsertData {
    fn new(table_name: String, fields: Vec<String>, values: Vec<Constant>) -> Self {
        Self {
            table_name,
            fields,
            values,
        }
    }
}

#[derive(Debug)]
pub struct CreateTableData {
    pub table_name: String,
    pub schema: Schema,
}

impl CreateTableData {
    fn new(table_name: String, schema: Schema) -> Self {
        Self { table_name, schema }
    }
}

#[derive(Debug)]
pub struct CreateViewData {
    pub view_name: String,
    pub query_data: QueryData,
}

impl CreateViewData {
    fn new(view_name: String, query_data: QueryData) -> Self {
        Self {
            view_name,
            query_data,
        }
    }

    /// The text stored in the view catalog
    pub fn view_def(&self) -> String {
        self.query_data.to_string()
    }
}

#[derive(Debug)]
pub struct CreateIndexData {
    pub index_name: String,
    pub table_name: String,
    pub field_name: String,
}

impl CreateIndexData {
    fn new(index_name: String, table_name: String, field_name: String) -> Self {
        Self {
            index_name,
            table_name,
            field_name,
        }
    }
}

#[derive(Debug)]
pub struct QueryData {
    pub fields: Vec<String>,
    pub tables: Vec<String>,
    pub predicate: Predicate,
}

impl QueryData {
    fn new(fields: Vec<String>, tables: Vec<String>, predicate: Predicate) -> Self {
        Self {
            fields,
            tables,
            predicate,
        }
    }
}

/// Renders the query back to SQL that parses to the same query
impl Display for QueryData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "select {} from {}",
            self.fields.join(", "),
            self.tables.join(", ")
        )?;
        if !self.predicate.is_empty() {
            write!(f, " where {}", self.predicate)?;
        }
        Ok(())
    }
}

pub struct Lexer<'a> {
    input: Peekable<Chars<'a>>,
    keywords: Vec<&'static str>,
    current_token: Option<Token>,
}

impl<'a> Lexer<'a> {
    const EQUAL: char = '=';
    const COMMA: char = ',';
    const DOT: char = '.';
    const ROUND_OPEN: char = '(';
    const ROUND_CLOSE: char = ')';
    const QUOTE: char = '\'';
    const MINUS: char = '-';

    pub fn new(string: &'a str) -> DbResult<Self> {
        let keywords = vec![
            "select", "from", "where", "and", "insert", "into", "values", "delete", "update",
            "set", "create", "table", "int", "varchar", "view", "as", "index", "on",
        ];
        let mut lexer = Self {
            input: string.chars().peekable(),
            keywords,
            current_token: None,
        };
        lexer.next_token()?;
        Ok(lexer)
    }

    pub fn current_token(&self) -> Option<&Token> {
        self.current_token.as_ref()
    }

    fn parse_string(&mut self) -> DbResult<Token> {
        self.input.next(); //  consume the opening quote
        let mut string = String::new();
        for c in self.input.by_ref() {
            if c == Self::QUOTE {
                return Ok(Token::StringConstant(string));
            }
            string.push(c);
        }
        Err(DbError::BadSyntax(format!("unterminated string '{string}")))
    }

    fn parse_number(&mut self) -> DbResult<Token> {
        let mut number = String::new();
        if self.input.peek() == Some(&Self::MINUS) {
            number.push(Self::MINUS);
            self.input.next();
        }
        while let Some(&c) = self.input.peek() {
            if !c.is_ascii_digit() {
                break;
            }
            number.push(c);
            self.input.next();
        }
        number
            .parse()
            .map(Token::IntConstant)
            .map_err(|_| DbError::BadSyntax(format!("invalid integer {number}")))
    }

    fn parse_identifier_or_keyword(&mut self) -> Token {
        let mut string = String::new();
        while let Some(&c) = self.input.peek() {
            if !c.is_alphanumeric() && c != '_' {
                break;
            }
            string.push(c.to_ascii_lowercase());
            self.input.next();
        }
        if self.keywords.contains(&string.as_str()) {
            return Token::Keyword(string);
        }
        Token::Identifier(string)
    }

    fn starts_negative_number(&self) -> bool {
        let mut ahead = self.input.clone();
        ahead.next();
        matches!(ahead.peek(), Some(c) if c.is_ascii_digit())
    }

    /// Move to the next token of the input, or to the end of input
    pub fn next_token(&mut self) -> DbResult<()> {
        while matches!(self.input.peek(), Some(c) if c.is_whitespace()) {
            self.input.next();
        }
        let Some(&c) = self.input.peek() else {
            self.current_token = None;
            return Ok(());
        };
        let token = match c {
            Self::EQUAL | Self::COMMA | Self::DOT | Self::ROUND_OPEN | Self::ROUND_CLOSE => {
                self.input.next();
                Token::Delimiter(c)
            }
            Self::QUOTE => self.parse_string()?,
            Self::MINUS if self.starts_negative_number() => self.parse_number()?,
            c if c.is_ascii_digit() => self.parse_number()?,
            c if c.is_alphabetic() || c == '_' => self.parse_identifier_or_keyword(),
            _ => return Err(DbError::BadSyntax(format!("unexpected character {c}"))),
        };
        self.current_token = Some(token);
        Ok(())
    }

    fn unexpected(&self, expected: &str) -> DbError {
        match &self.current_token {
            Some(token) => DbError::BadSyntax(format!("expected {expected} but found {token}")),
            None => DbError::BadSyntax(format!("expected {expected} but found end of input")),
        }
    }

    pub fn match_delim(&self, ch: char) -> bool {
        matches!(self.current_token, Some(Token::Delimiter(d)) if d == ch)
    }

    pub fn eat_delim(&mut self, ch: char) -> DbResult<()> {
        if !self.match_delim(ch) {
            return Err(self.unexpected(&format!("'{ch}'")));
        }
        self.next_token()
    }

    pub fn match_int_constant(&self) -> bool {
        matches!(self.current_token, Some(Token::IntConstant(_)))
    }

    pub fn eat_int_constant(&mut self) -> DbResult<i32> {
        let Some(Token::IntConstant(i)) = self.current_token else {
            return Err(self.unexpected("an integer"));
        };
        self.next_token()?;
        Ok(i)
    }

    pub fn match_string_constant(&self) -> bool {
        matches!(self.current_token, Some(Token::StringConstant(_)))
    }

    pub fn eat_string_constant(&mut self) -> DbResult<String> {
        let Some(Token::StringConstant(s)) = self.current_token.clone() else {
            return Err(self.unexpected("a string"));
        };
        self.next_token()?;
        Ok(s)
    }

    pub fn match_identifier(&self) -> bool {
        matches!(self.current_token, Some(Token::Identifier(_)))
    }

    pub fn eat_identifier(&mut self) -> DbResult<String> {
        let Some(Token::Identifier(id)) = self.current_token.clone() else {
            return Err(self.unexpected("an identifier"));
        };
        self.next_token()?;
        Ok(id)
    }

    pub fn match_keyword(&self, keyword: &str) -> bool {
        matches!(&self.current_token, Some(Token::Keyword(token)) if token == keyword)
    }

    pub fn eat_keyword(&mut self, keyword: &str) -> DbResult<()> {
        if !self.match_keyword(keyword) {
            return Err(self.unexpected(keyword));
        }
        self.next_token()
    }

    pub fn eat_end(&self) -> DbResult<()> {
        match &self.current_token {
            None => Ok(()),
            Some(_) => Err(self.unexpected("end of statement")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Token {
    Keyword(String),
    Identifier(String),
    IntConstant(i32),
    StringConstant(String),
    Delimiter(char),
}

impl Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Keyword(k) => write!(f, "keyword {k}"),
            Token::Identifier(i) => write!(f, "identifier {i}"),
            Token::IntConstant(n) => write!(f, "{n}"),
            Token::StringConstant(s) => write!(f, "'{s}'"),
            Token::Delimiter(d) => write!(f, "'{d}'"),
        }
    }
}


#[cfg(test)]
mod parser_tests {
    use super::{Parser, SQLStatement};
    use crate::{Constant, DbError, Expression, FieldType};

    #[test]
    fn parse_basic_select_statement() {
        let sql = "SELECT name, age FROM users WHERE id = 3 AND name = 'John'";
        let query_data = Parser::new(sql).unwrap().parse_query().unwrap();

        assert_eq!(query_data.fields, vec!["name", "age"]);
        assert_eq!(query_data.tables, vec!["users"]);
        let terms = query_data.predicate.terms();
        assert_eq!(terms.len(), 2);
        assert_eq!(terms[0].lhs, Expression::Field("id".to_string()));
        assert_eq!(terms[0].rhs, Expression::Constant(Constant::Int(3)));
        assert_eq!(
            terms[1].rhs,
            Expression::Constant(Constant::String("John".to_string()))
        );
    }

    #[test]
    fn test_query_display_reparses() {
        let sql = "select a, b from t1, t2 where a = b and b = 'x'";
        let query = Parser::new(sql).unwrap().parse_query().unwrap();
        assert_eq!(query.to_string(), sql);
        let again = Parser::new(&query.to_string())
            .unwrap()
            .parse_query()
            .unwrap();
        assert_eq!(again.to_string(), sql);
    }

    #[test]
    fn test_create_table() {
        let sql = "CREATE TABLE students (id int, name varchar(20), age int)";
        let stmt = Parser::new(sql).unwrap().parse_update().unwrap();

        let SQLStatement::CreateTableData(create_table) = stmt else {
            panic!("Expected CreateTableData");
        };
        assert_eq!(create_table.table_name, "students");
        assert_eq!(create_table.schema.fields, vec!["id", "name", "age"]);
        assert_eq!(
            create_table.schema.field_type("name"),
            Some(FieldType::String)
        );
        assert_eq!(create_table.schema.length("name"), Some(20));
    }

    #[test]
    fn test_insert() {
        let sql = "INSERT INTO users (name, age) VALUES ('Alice', 25)";
        let stmt = Parser::new(sql).unwrap().parse_update().unwrap();

        let SQLStatement::InsertData(insert) = stmt else {
            panic!("Expected InsertData");
        };
        assert_eq!(insert.table_name, "users");
        assert_eq!(insert.fields, vec!["name", "age"]);
        assert_eq!(
            insert.values,
            vec![Constant::String("Alice".to_string()), Constant::Int(25)]
        );
    }

    #[test]
    fn test_insert_count_mismatch() {
        let sql = "insert into users (name, age) values ('Alice')";
        let err = Parser::new(sql).unwrap().parse_update().unwrap_err();
        assert!(matches!(err, DbError::BadSyntax(_)));
    }

    #[test]
    fn test_delete() {
        let sql = "DELETE FROM users WHERE age = 30";
        let stmt = Parser::new(sql).unwrap().parse_update().unwrap();

        let SQLStatement::DeleteData(delete) = stmt else {
            panic!("Expected DeleteData");
        };
        assert_eq!(delete.table_name, "users");
        assert_eq!(
            delete.predicate.equates_with_constant("age"),
            Some(&Constant::Int(30))
        );
    }

    #[test]
    fn test_update_with_field_expression() {
        let sql = "UPDATE employees SET salary = bonus WHERE department = 'IT'";
        let stmt = Parser::new(sql).unwrap().parse_update().unwrap();

        let SQLStatement::ModifyData(modify) = stmt else {
            panic!("Expected ModifyData");
        };
        assert_eq!(modify.table_name, "employees");
        assert_eq!(modify.field_name, "salary");
        assert_eq!(modify.new_value, Expression::Field("bonus".to_string()));
        assert_eq!(
            modify.predicate.equates_with_constant("department"),
            Some(&Constant::String("IT".to_string()))
        );
    }

    #[test]
    fn test_create_index() {
        let sql = "CREATE INDEX idx_name ON users (name)";
        let stmt = Parser::new(sql).unwrap().parse_update().unwrap();

        let SQLStatement::CreateIndexData(create_index) = stmt else {
            panic!("Expected CreateIndexData");
        };
        assert_eq!(create_index.index_name, "idx_name");
        assert_eq!(create_index.table_name, "users");
        assert_eq!(create_index.field_name, "name");
    }

    #[test]
    fn test_create_view() {
        let sql = "CREATE VIEW high_salary AS SELECT name, salary FROM employees WHERE grade = 3";
        let stmt = Parser::new(sql).unwrap().parse_update().unwrap();

        let SQLStatement::CreateViewData(create_view) = stmt else {
            panic!("Expected CreateViewData");
        };
        assert_eq!(create_view.view_name, "high_salary");
        assert_eq!(create_view.query_data.fields, vec!["name", "salary"]);
        assert_eq!(
            create_view.view_def(),
            "select name, salary from employees where grade = 3"
        );
    }

    #[test]
    fn test_syntax_errors() {
        for sql in [
            "select from t",
            "select a from",
            "select a from t where a > 3",
            "select a from t extra",
            "create thing x",
            "update t set a = 1 where",
            "insert into t (a) values (1",
        ] {
            let result = Parser::new(sql).and_then(|mut p| {
                if sql.starts_with("select") {
                    p.parse_query().map(|_| ())
                } else {
                    p.parse_update().map(|_| ())
                }
            });
            assert!(
                matches!(result, Err(DbError::BadSyntax(_))),
                "{sql} should not parse"
            );
        }
    }
}
