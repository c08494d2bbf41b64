use std::{collections::HashMap, fmt::Display, sync::Arc};

use crate::{BlockId, Constant, DbError, DbResult, Page, Scan, Transaction, UpdateScan};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Int,
    String,
}

impl FieldType {
    /// The type code stored in the field catalog
    pub fn code(self) -> i32 {
        match self {
            FieldType::Int => 4,
            FieldType::String => 12,
        }
    }

    pub fn from_code(code: i32) -> DbResult<Self> {
        match code {
            4 => Ok(FieldType::Int),
            12 => Ok(FieldType::String),
            other => Err(DbError::Catalog(format!("unknown field type code {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldInfo {
    pub field_type: FieldType,
    /// Maximum number of characters for strings, unused for ints
    pub length: usize,
}

/// The logical description of a record: field names in order, with type and length
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schema {
    pub fields: Vec<String>,
    pub info: HashMap<String, FieldInfo>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_field(&mut self, field_name: &str, field_type: FieldType, length: usize) {
        if !self.info.contains_key(field_name) {
            self.fields.push(field_name.to_string());
        }
        self.info
            .insert(field_name.to_string(), FieldInfo { field_type, length });
    }

    pub fn add_int_field(&mut self, field_name: &str) {
        self.add_field(field_name, FieldType::Int, 0);
    }

    pub fn add_string_field(&mut self, field_name: &str, length: usize) {
        self.add_field(field_name, FieldType::String, length);
    }

    /// Copy one field definition out of another schema
    pub fn add_from_schema(&mut self, field_name: &str, schema: &Schema) -> DbResult<()> {
        let info = schema.info.get(field_name).ok_or_else(|| {
            DbError::SchemaViolation(format!("field {field_name} not found in schema"))
        })?;
        self.add_field(field_name, info.field_type, info.length);
        Ok(())
    }

    pub fn add_all_from_schema(&mut self, schema: &Schema) -> DbResult<()> {
        for field in &schema.fields {
            self.add_from_schema(field, schema)?;
        }
        Ok(())
    }

    pub fn has_field(&self, field_name: &str) -> bool {
        self.info.contains_key(field_name)
    }

    pub fn field_type(&self, field_name: &str) -> Option<FieldType> {
        self.info.get(field_name).map(|info| info.field_type)
    }

    pub fn length(&self, field_name: &str) -> Option<usize> {
        self.info.get(field_name).map(|info| info.length)
    }

    /// Strings are stored one byte per character and may not exceed the declared length
    pub fn check_string(&self, field_name: &str, value: &str) -> DbResult<()> {
        let info = self.info.get(field_name).ok_or_else(|| {
            DbError::SchemaViolation(format!("field {field_name} not found in schema"))
        })?;
        if info.field_type != FieldType::String {
            return Err(DbError::SchemaViolation(format!(
                "field {field_name} does not hold strings"
            )));
        }
        if !value.is_ascii() {
            return Err(DbError::SchemaViolation(format!(
                "value for {field_name} contains non-ASCII characters"
            )));
        }
        if value.len() > info.length {
            return Err(DbError::SchemaViolation(format!(
                "value of {} characters is too long for {field_name} varchar({})",
                value.len(),
                info.length
            )));
        }
        Ok(())
    }
}

/// The physical placement of a [`Schema`] inside a record slot
/// Each slot starts with an in-use flag, fields follow in schema order
#[derive(Debug, Clone, PartialEq)]
pub struct Layout {
    pub schema: Schema,
    offsets: HashMap<String, usize>,
    slot_size: usize,
}

impl Layout {
    pub fn new(schema: Schema) -> Self {
        let mut offsets = HashMap::new();
        let mut pos = Page::INT_BYTES;
        for field in &schema.fields {
            offsets.insert(field.clone(), pos);
            pos += Self::length_in_bytes(&schema.info[field]);
        }
        Self {
            schema,
            offsets,
            slot_size: pos,
        }
    }

    /// Rebuild a layout from what the catalog recorded
    pub fn from_metadata(
        schema: Schema,
        offsets: HashMap<String, usize>,
        slot_size: usize,
    ) -> Self {
        Self {
            schema,
            offsets,
            slot_size,
        }
    }

    fn length_in_bytes(info: &FieldInfo) -> usize {
        match info.field_type {
            FieldType::Int => Page::INT_BYTES,
            FieldType::String => Page::max_length(info.length),
        }
    }

    pub fn offset(&self, field_name: &str) -> Option<usize> {
        self.offsets.get(field_name).copied()
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }
}

#[cfg(test)]
mod layout_tests {
    use super::*;

    #[test]
    fn test_offsets_follow_the_flag() {
        let mut schema = Schema::new();
        schema.add_int_field("a");
        schema.add_string_field("b", 9);
        let layout = Layout::new(schema);
        assert_eq!(layout.offset("a"), Some(4));
        assert_eq!(layout.offset("b"), Some(8));
        assert_eq!(layout.offset("c"), None);
        assert_eq!(layout.slot_size(), 21);
    }

    #[test]
    fn test_add_from_schema() {
        let mut source = Schema::new();
        source.add_int_field("id");
        source.add_string_field("name", 10);

        let mut target = Schema::new();
        target.add_from_schema("name", &source).unwrap();
        assert_eq!(target.fields, vec!["name".to_string()]);
        assert_eq!(target.field_type("name"), Some(FieldType::String));
        assert_eq!(target.length("name"), Some(10));
        assert!(matches!(
            target.add_from_schema("missing", &source),
            Err(DbError::SchemaViolation(_))
        ));

        target.add_all_from_schema(&source).unwrap();
        assert_eq!(target.fields, vec!["name".to_string(), "id".to_string()]);
    }

    #[test]
    fn test_type_codes() {
        assert_eq!(FieldType::Int.code(), 4);
        assert_eq!(FieldType::String.code(), 12);
        assert_eq!(FieldType::from_code(12).unwrap(), FieldType::String);
        assert!(FieldType::from_code(7).is_err());
    }
}

/// Identifies a record by block and slot within its table file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RID {
    pub block_num: usize,
    pub slot: usize,
}

impl RID {
    pub fn new(block_num: usize, slot: usize) -> Self {
        Self { block_num, slot }
    }
}

impl Display for RID {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.block_num, self.slot)
    }
}

/// A block of fixed-size record slots, pinned for as long as the page is open
pub struct RecordPage {
    txn: Arc<Transaction>,
    block_id: BlockId,
    layout: Layout,
}

impl RecordPage {
    const EMPTY: i32 = 0;
    const USED: i32 = 1;

    pub fn new(txn: Arc<Transaction>, block_id: BlockId, layout: Layout) -> DbResult<Self> {
        txn.pin(&block_id)?;
        Ok(Self {
            txn,
            block_id,
            layout,
        })
    }

    pub fn block_id(&self) -> &BlockId {
        &self.block_id
    }

    fn field_pos(&self, slot: usize, field_name: &str) -> DbResult<usize> {
        let offset = self.layout.offset(field_name).ok_or_else(|| {
            DbError::SchemaViolation(format!("field {field_name} not found in layout"))
        })?;
        Ok(self.offset(slot) + offset)
    }

    pub fn get_int(&self, slot: usize, field_name: &str) -> DbResult<i32> {
        self.txn
            .get_int(&self.block_id, self.field_pos(slot, field_name)?)
    }

    pub fn get_string(&self, slot: usize, field_name: &str) -> DbResult<String> {
        self.txn
            .get_string(&self.block_id, self.field_pos(slot, field_name)?)
    }

    pub fn set_int(&self, slot: usize, field_name: &str, value: i32) -> DbResult<()> {
        self.txn
            .set_int(&self.block_id, self.field_pos(slot, field_name)?, value, true)
    }

    pub fn set_string(&self, slot: usize, field_name: &str, value: &str) -> DbResult<()> {
        self.layout.schema.check_string(field_name, value)?;
        self.txn
            .set_string(&self.block_id, self.field_pos(slot, field_name)?, value, true)
    }

    pub fn delete(&self, slot: usize) -> DbResult<()> {
        self.set_flag(slot, Self::EMPTY)
    }

    /// Reset every slot to empty with zeroed fields
    /// These writes are not logged since the block has no previous contents worth restoring
    pub fn format(&self) -> DbResult<()> {
        let mut slot = 0;
        while self.is_valid_slot(slot) {
            self.txn
                .set_int(&self.block_id, self.offset(slot), Self::EMPTY, false)?;
            for field in &self.layout.schema.fields {
                let pos = self.field_pos(slot, field)?;
                match self.layout.schema.info[field].field_type {
                    FieldType::Int => self.txn.set_int(&self.block_id, pos, 0, false)?,
                    FieldType::String => self.txn.set_string(&self.block_id, pos, "", false)?,
                }
            }
            slot += 1;
        }
        Ok(())
    }

    /// The first used slot after `slot`, or after the start of the page for `None`
    pub fn next_after(&self, slot: Option<usize>) -> DbResult<Option<usize>> {
        self.search_after(slot, Self::USED)
    }

    /// Claim the first empty slot after `slot`
    pub fn insert_after(&self, slot: Option<usize>) -> DbResult<Option<usize>> {
        let found = self.search_after(slot, Self::EMPTY)?;
        if let Some(slot) = found {
            self.set_flag(slot, Self::USED)?;
        }
        Ok(found)
    }

    fn set_flag(&self, slot: usize, flag: i32) -> DbResult<()> {
        self.txn
            .set_int(&self.block_id, self.offset(slot), flag, true)
    }

    fn search_after(&self, slot: Option<usize>, flag: i32) -> DbResult<Option<usize>> {
        let mut slot = slot.map_or(0, |s| s + 1);
        while self.is_valid_slot(slot) {
            if self.txn.get_int(&self.block_id, self.offset(slot))? == flag {
                return Ok(Some(slot));
            }
            slot += 1;
        }
        Ok(None)
    }

    fn is_valid_slot(&self, slot: usize) -> bool {
        self.offset(slot + 1) <= self.txn.block_size()
    }

    fn offset(&self, slot: usize) -> usize {
        slot * self.layout.slot_size()
    }

    /// Release the pin taken when the page was opened
    pub fn close(self) {
        self.txn.unpin(&self.block_id);
    }
}

/// A cursor over every record of a table's heap file
pub struct TableScan {
    txn: Arc<Transaction>,
    layout: Layout,
    file_name: String,
    record_page: Option<RecordPage>,
    current_slot: Option<usize>,
}

impl TableScan {
    pub fn new(txn: Arc<Transaction>, table_name: &str, layout: Layout) -> DbResult<Self> {
        let file_name = format!("{table_name}.tbl");
        let mut scan = Self {
            txn,
            layout,
            file_name,
            record_page: None,
            current_slot: None,
        };
        if scan.txn.size(&scan.file_name)? == 0 {
            scan.move_to_new_block()?;
        } else {
            scan.move_to_block(0)?;
        }
        Ok(scan)
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    fn record_page(&self) -> &RecordPage {
        self.record_page
            .as_ref()
            .unwrap_or_else(|| panic!("table scan over {} used after close", self.file_name))
    }

    fn current_slot(&self) -> usize {
        self.current_slot
            .unwrap_or_else(|| panic!("table scan over {} has no current record", self.file_name))
    }

    fn current_block_num(&self) -> usize {
        self.record_page().block_id().block_num
    }

    fn move_to_block(&mut self, block_num: usize) -> DbResult<()> {
        self.close_page();
        let block_id = BlockId::new(self.file_name.clone(), block_num);
        self.record_page = Some(RecordPage::new(
            Arc::clone(&self.txn),
            block_id,
            self.layout.clone(),
        )?);
        self.current_slot = None;
        Ok(())
    }

    fn move_to_new_block(&mut self) -> DbResult<()> {
        self.close_page();
        let block_id = self.txn.append(&self.file_name)?;
        let record_page = RecordPage::new(Arc::clone(&self.txn), block_id, self.layout.clone())?;
        record_page.format()?;
        self.record_page = Some(record_page);
        self.current_slot = None;
        Ok(())
    }

    fn at_last_block(&self) -> DbResult<bool> {
        Ok(self.current_block_num() + 1 >= self.txn.size(&self.file_name)?)
    }

    fn close_page(&mut self) {
        if let Some(record_page) = self.record_page.take() {
            record_page.close();
        }
    }
}

impl Scan for TableScan {
    fn before_first(&mut self) -> DbResult<()> {
        self.move_to_block(0)
    }

    fn next(&mut self) -> DbResult<bool> {
        loop {
            self.current_slot = self.record_page().next_after(self.current_slot)?;
            if self.current_slot.is_some() {
                return Ok(true);
            }
            if self.at_last_block()? {
                return Ok(false);
            }
            let next_block = self.current_block_num() + 1;
            self.move_to_block(next_block)?;
        }
    }

    fn get_int(&self, field_name: &str) -> DbResult<i32> {
        self.record_page().get_int(self.current_slot(), field_name)
    }

    fn get_string(&self, field_name: &str) -> DbResult<String> {
        self.record_page()
            .get_string(self.current_slot(), field_name)
    }

    fn get_value(&self, field_name: &str) -> DbResult<Constant> {
        match self.layout.schema.field_type(field_name) {
            Some(FieldType::Int) => Ok(Constant::Int(self.get_int(field_name)?)),
            Some(FieldType::String) => Ok(Constant::String(self.get_string(field_name)?)),
            None => Err(DbError::SchemaViolation(format!(
                "field {field_name} not found in {}",
                self.file_name
            ))),
        }
    }

    fn has_field(&self, field_name: &str) -> bool {
        self.layout.schema.has_field(field_name)
    }

    fn close(&mut self) {
        self.close_page();
    }
}

impl UpdateScan for TableScan {
    fn set_int(&mut self, field_name: &str, value: i32) -> DbResult<()> {
        self.record_page()
            .set_int(self.current_slot(), field_name, value)
    }

    fn set_string(&mut self, field_name: &str, value: &str) -> DbResult<()> {
        self.record_page()
            .set_string(self.current_slot(), field_name, value)
    }

    fn set_value(&mut self, field_name: &str, value: &Constant) -> DbResult<()> {
        match (self.layout.schema.field_type(field_name), value) {
            (Some(FieldType::Int), Constant::Int(n)) => self.set_int(field_name, *n),
            (Some(FieldType::String), Constant::String(s)) => self.set_string(field_name, s),
            (Some(_), _) => Err(DbError::SchemaViolation(format!(
                "value {value} does not match the type of field {field_name}"
            ))),
            (None, _) => Err(DbError::SchemaViolation(format!(
                "field {field_name} not found in {}",
                self.file_name
            ))),
        }
    }

    /// Position on a freshly claimed slot, appending a block when every existing one is full
    fn insert(&mut self) -> DbResult<()> {
        loop {
            self.current_slot = self.record_page().insert_after(self.current_slot)?;
            if self.current_slot.is_some() {
                return Ok(());
            }
            if self.at_last_block()? {
                self.move_to_new_block()?;
            } else {
                let next_block = self.current_block_num() + 1;
                self.move_to_block(next_block)?;
            }
        }
    }

    fn delete(&mut self) -> DbResult<()> {
        self.record_page().delete(self.current_slot())
    }

    fn get_rid(&self) -> RID {
        RID::new(self.current_block_num(), self.current_slot())
    }

    fn move_to_rid(&mut self, rid: RID) -> DbResult<()> {
        self.move_to_block(rid.block_num)?;
        self.current_slot = Some(rid.slot);
        Ok(())
    }
}
