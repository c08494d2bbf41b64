use std::sync::Arc;

use tracing::{debug, warn};

use crate::{
    BlockId, Constant, DbError, DbResult, FieldType, IndexInfo, Layout, Page, Schema,
    Transaction, RID,
};

/// A secondary index mapping data values to the [`RID`]s of the records holding them
pub trait Index {
    /// Position the index before the first entry with `search_key`
    fn before_first(&mut self, search_key: &Constant) -> DbResult<()>;
    /// Move to the next entry with the search key, returning false when there are no more
    fn next(&mut self) -> DbResult<bool>;
    fn get_data_rid(&self) -> DbResult<RID>;
    fn insert(&mut self, data_val: &Constant, data_rid: RID) -> DbResult<()>;
    fn delete(&mut self, data_val: &Constant, data_rid: RID) -> DbResult<()>;
    fn close(&mut self);
}

/// A B+-tree index stored in two files, `<name>leaf` and `<name>dir`
/// The root of the tree is always block 0 of the directory file
pub struct BTreeIndex {
    txn: Arc<Transaction>,
    dir_layout: Layout,
    leaf_layout: Layout,
    leaf_table_name: String,
    leaf: Option<BTreeLeaf>,
    root_block: BlockId,
}

impl BTreeIndex {
    pub fn new(txn: Arc<Transaction>, index_name: &str, leaf_layout: Layout) -> DbResult<Self> {
        //  Create the leaf file with the schema provided if it does not exist
        let leaf_table_name = format!("{index_name}leaf");
        if txn.size(&leaf_table_name)? == 0 {
            let block_id = txn.append(&leaf_table_name)?;
            let leaf_page = BTreePage::new(Arc::clone(&txn), block_id, leaf_layout.clone())?;
            leaf_page.format(BTreePage::NO_OVERFLOW)?;
            leaf_page.close();
        }

        //  Create the directory file with the schema required if it does not exist
        let mut dir_schema = Schema::new();
        dir_schema.add_from_schema(IndexInfo::BLOCK_FIELD, &leaf_layout.schema)?;
        dir_schema.add_from_schema(IndexInfo::DATA_FIELD, &leaf_layout.schema)?;
        let dir_table_name = format!("{index_name}dir");
        let dir_layout = Layout::new(dir_schema.clone());
        let root_block = BlockId::new(dir_table_name.clone(), 0);
        if txn.size(&dir_table_name)? == 0 {
            txn.append(&dir_table_name)?;
            let root = BTreePage::new(Arc::clone(&txn), root_block.clone(), dir_layout.clone())?;
            root.format(0)?;
            //  every search key is at least the minimum, so the root always has a child to follow
            let min_val = match dir_schema.field_type(IndexInfo::DATA_FIELD) {
                Some(FieldType::String) => Constant::String(String::new()),
                _ => Constant::Int(i32::MIN),
            };
            root.insert_dir(0, &min_val, 0)?;
            root.close();
        }
        Ok(Self {
            txn,
            dir_layout,
            leaf_layout,
            leaf_table_name,
            leaf: None,
            root_block,
        })
    }

    /// Estimated block accesses for one lookup: the directory levels plus the leaf
    pub fn search_cost(num_blocks: usize, records_per_block: usize) -> usize {
        let rpb = records_per_block.max(2);
        let mut levels = 0;
        let mut reach = 1usize;
        while reach < num_blocks {
            reach = reach.saturating_mul(rpb);
            levels += 1;
        }
        1 + levels
    }

    fn open_root(&self) -> DbResult<BTreeDir> {
        BTreeDir::new(
            Arc::clone(&self.txn),
            self.root_block.clone(),
            self.dir_layout.clone(),
        )
    }

    fn leaf(&self) -> &BTreeLeaf {
        self.leaf
            .as_ref()
            .unwrap_or_else(|| panic!("index used before before_first"))
    }
}

impl Index for BTreeIndex {
    fn before_first(&mut self, search_key: &Constant) -> DbResult<()> {
        self.close();
        let mut root = self.open_root()?;
        let leaf_block_num = root.search(search_key);
        root.close();
        let leaf_block_id = BlockId::new(self.leaf_table_name.clone(), leaf_block_num?);
        self.leaf = Some(BTreeLeaf::new(
            Arc::clone(&self.txn),
            leaf_block_id,
            self.leaf_layout.clone(),
            search_key.clone(),
        )?);
        Ok(())
    }

    fn next(&mut self) -> DbResult<bool> {
        self.leaf
            .as_mut()
            .unwrap_or_else(|| panic!("index used before before_first"))
            .next()
    }

    fn get_data_rid(&self) -> DbResult<RID> {
        self.leaf().get_data_rid()
    }

    fn insert(&mut self, data_val: &Constant, data_rid: RID) -> DbResult<()> {
        self.before_first(data_val)?;
        let Some(mut leaf) = self.leaf.take() else {
            return Ok(());
        };
        let entry = leaf.insert(data_rid);
        leaf.close();
        let Some(entry) = entry? else {
            return Ok(());
        };
        debug!(split_key = %entry.dataval, new_block = entry.block_num, "leaf split");
        let root = self.open_root()?;
        let root_split = root.insert(entry);
        let result = match root_split {
            Ok(Some(root_entry)) => {
                debug!(split_key = %root_entry.dataval, "root split");
                root.make_new_root(root_entry)
            }
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };
        root.close();
        result
    }

    fn delete(&mut self, data_val: &Constant, data_rid: RID) -> DbResult<()> {
        self.before_first(data_val)?;
        let Some(mut leaf) = self.leaf.take() else {
            return Ok(());
        };
        let result = leaf.delete(data_rid);
        leaf.close();
        result
    }

    fn close(&mut self) {
        if let Some(leaf) = self.leaf.take() {
            leaf.close();
        }
    }
}

/// An entry pointing from a directory page to a child block
#[derive(Debug, Clone, PartialEq)]
pub struct DirEntry {
    pub dataval: Constant,
    pub block_num: usize,
}

/// An interior node of the tree; the flag of its page is the level, 0 meaning its children are leaves
pub struct BTreeDir {
    txn: Arc<Transaction>,
    layout: Layout,
    contents: BTreePage,
}

impl BTreeDir {
    pub fn new(txn: Arc<Transaction>, block_id: BlockId, layout: Layout) -> DbResult<Self> {
        let contents = BTreePage::new(Arc::clone(&txn), block_id, layout.clone())?;
        Ok(Self {
            txn,
            layout,
            contents,
        })
    }

    pub fn close(self) {
        self.contents.close();
    }

    /// Walk down to the level 0 directory for the key and return the leaf block number it points at
    pub fn search(&mut self, search_key: &Constant) -> DbResult<usize> {
        let mut child_block = self.find_child_block(search_key)?;
        while self.contents.get_flag()? > 0 {
            let child =
                BTreePage::new(Arc::clone(&self.txn), child_block.clone(), self.layout.clone())?;
            std::mem::replace(&mut self.contents, child).close();
            child_block = self.find_child_block(search_key)?;
        }
        Ok(child_block.block_num)
    }

    /// Give the root a new level while keeping it at block 0
    /// The current entries move to a fresh block, and the root then points at that block and the new entry
    pub fn make_new_root(&self, entry: DirEntry) -> DbResult<()> {
        let first_value = self.contents.get_data_value(0)?;
        let level = self.contents.get_flag()?;
        let new_block_id = self.contents.split(0, level)?;
        let old_root = DirEntry {
            dataval: first_value,
            block_num: new_block_id.block_num,
        };
        self.insert_entry(old_root)?;
        self.insert_entry(entry)?;
        self.contents.set_flag(level + 1)
    }

    /// Insert an entry for a new child into the subtree rooted here
    /// Returns an entry for this node's parent when this node had to split
    pub fn insert(&self, entry: DirEntry) -> DbResult<Option<DirEntry>> {
        if self.contents.get_flag()? == 0 {
            return self.insert_entry(entry);
        }
        let child_block = self.find_child_block(&entry.dataval)?;
        let child = BTreeDir::new(Arc::clone(&self.txn), child_block, self.layout.clone())?;
        let new_entry = child.insert(entry);
        child.close();
        match new_entry? {
            Some(entry) => self.insert_entry(entry),
            None => Ok(None),
        }
    }

    fn insert_entry(&self, entry: DirEntry) -> DbResult<Option<DirEntry>> {
        let slot = self
            .contents
            .find_slot_before(&entry.dataval)?
            .map_or(0, |slot| slot + 1);
        self.contents
            .insert_dir(slot, &entry.dataval, entry.block_num)?;
        if !self.contents.is_full()? {
            return Ok(None);
        }

        let level = self.contents.get_flag()?;
        let split_point = self.contents.get_number_of_recs()? / 2;
        let split_value = self.contents.get_data_value(split_point)?;
        let new_block_id = self.contents.split(split_point, level)?;
        debug!(block = %new_block_id, level, "directory split");
        Ok(Some(DirEntry {
            dataval: split_value,
            block_num: new_block_id.block_num,
        }))
    }

    /// The child to follow for a key: the entry before it, or the entry equal to it
    fn find_child_block(&self, search_key: &Constant) -> DbResult<BlockId> {
        let num_recs = self.contents.get_number_of_recs()?;
        let mut slot = self.contents.find_slot_before(search_key)?;
        let next = slot.map_or(0, |s| s + 1);
        if next < num_recs && self.contents.get_data_value(next)? == *search_key {
            slot = Some(next);
        }
        let block_num = self.contents.get_child_num(slot.unwrap_or(0))?;
        Ok(BlockId::new(
            self.contents.block_id().filename.clone(),
            block_num,
        ))
    }
}

/// A leaf node holding `(dataval, rid)` entries in key order
/// A leaf whose flag names a block has an overflow chain: that block holds more entries with
/// the same key as this leaf's first entry
/// Main Page:          Overflow Block:
/// [K5, K6]  ------->  [K5, K5, K5, K5]
pub struct BTreeLeaf {
    txn: Arc<Transaction>,
    layout: Layout,
    search_key: Constant,
    contents: BTreePage,
    current_slot: Option<usize>,
}

impl BTreeLeaf {
    pub fn new(
        txn: Arc<Transaction>,
        block_id: BlockId,
        layout: Layout,
        search_key: Constant,
    ) -> DbResult<Self> {
        let contents = BTreePage::new(Arc::clone(&txn), block_id, layout.clone())?;
        let current_slot = contents.find_slot_before(&search_key)?;
        Ok(Self {
            txn,
            layout,
            search_key,
            contents,
            current_slot,
        })
    }

    pub fn close(self) {
        self.contents.close();
    }

    fn advance(&mut self) -> usize {
        let slot = self.current_slot.map_or(0, |slot| slot + 1);
        self.current_slot = Some(slot);
        slot
    }

    /// Advances to the next record that matches the search key
    /// If we've reached the end of the current page, attempts to follow the overflow chain
    pub fn next(&mut self) -> DbResult<bool> {
        let slot = self.advance();
        if slot >= self.contents.get_number_of_recs()? {
            self.try_overflow()
        } else if self.contents.get_data_value(slot)? == self.search_key {
            Ok(true)
        } else {
            self.try_overflow()
        }
    }

    /// Deletes the record with the specified RID from this leaf page or its overflow chain
    /// A RID that is not present leaves the index untouched
    pub fn delete(&mut self, rid: RID) -> DbResult<()> {
        while self.next()? {
            if let Some(slot) = self.current_slot {
                if self.contents.get_rid(slot)? == rid {
                    self.contents.delete(slot)?;
                    if slot == 0 {
                        self.refill_from_overflow()?;
                    }
                    return Ok(());
                }
            }
        }
        warn!(%rid, key = %self.search_key, "rid not found in index");
        Ok(())
    }

    /// Insert an entry for the search key
    /// If the page splits, return the [`DirEntry`] identifying the new page to the parent directory
    pub fn insert(&mut self, rid: RID) -> DbResult<Option<DirEntry>> {
        //  An overflowing page keeps its first key equal to the overflow entries, so a smaller key
        //  moves everything out and takes over this page
        if self.contents.get_flag()? >= 0
            && self.contents.get_number_of_recs()? > 0
            && self.contents.get_data_value(0)? > self.search_key
        {
            let first_entry = self.contents.get_data_value(0)?;
            let new_block_id = self.contents.split(0, self.contents.get_flag()?)?;
            self.current_slot = Some(0);
            self.contents.set_flag(BTreePage::NO_OVERFLOW)?;
            self.contents.insert_leaf(0, &self.search_key, rid)?;
            return Ok(Some(DirEntry {
                dataval: first_entry,
                block_num: new_block_id.block_num,
            }));
        }

        let slot = self.advance();
        self.contents.insert_leaf(slot, &self.search_key, rid)?;
        if !self.contents.is_full()? {
            return Ok(None);
        }

        let num_recs = self.contents.get_number_of_recs()?;
        let first_key = self.contents.get_data_value(0)?;
        let last_key = self.contents.get_data_value(num_recs - 1)?;
        if first_key == last_key {
            //  Keep the first record here and chain the rest into an overflow block
            let new_block_id = self.contents.split(1, self.contents.get_flag()?)?;
            self.contents.set_flag(new_block_id.block_num as i32)?;
            debug!(block = %new_block_id, key = %first_key, "leaf overflow");
            return Ok(None);
        }

        //  Runs of equal keys must stay on one page. If the middle key equals the first key move
        //  the split point right past the run, otherwise move it left to the start of its run
        let mut split_point = num_recs / 2;
        let mut split_key = self.contents.get_data_value(split_point)?;
        if split_key == first_key {
            while self.contents.get_data_value(split_point)? == first_key {
                split_point += 1;
            }
            split_key = self.contents.get_data_value(split_point)?;
        } else {
            while self.contents.get_data_value(split_point - 1)? == split_key {
                split_point -= 1;
            }
        }
        let new_block_id = self.contents.split(split_point, BTreePage::NO_OVERFLOW)?;
        Ok(Some(DirEntry {
            dataval: split_key,
            block_num: new_block_id.block_num,
        }))
    }

    /// An overflow chain is only reachable through slot 0 of the page in front of it
    /// Move the first overflow entry into slot 0, unlinking the overflow block once it empties
    fn refill_from_overflow(&self) -> DbResult<()> {
        let flag = self.contents.get_flag()?;
        if flag < 0 {
            return Ok(());
        }
        let overflow_block = BlockId::new(
            self.contents.block_id().filename.clone(),
            flag as usize,
        );
        let overflow = BTreePage::new(Arc::clone(&self.txn), overflow_block, self.layout.clone())?;
        let result = (|| -> DbResult<()> {
            let num_recs = overflow.get_number_of_recs()?;
            if num_recs > 0 {
                let dataval = overflow.get_data_value(0)?;
                let rid = overflow.get_rid(0)?;
                overflow.delete(0)?;
                self.contents.insert_leaf(0, &dataval, rid)?;
            }
            if num_recs <= 1 {
                self.contents.set_flag(overflow.get_flag()?)?;
            }
            Ok(())
        })();
        overflow.close();
        result
    }

    /// Swap in the overflow block for this page when the search key continues there
    fn try_overflow(&mut self) -> DbResult<bool> {
        if self.contents.get_number_of_recs()? == 0 {
            return Ok(false);
        }
        let first_key = self.contents.get_data_value(0)?;
        let flag = self.contents.get_flag()?;
        if first_key != self.search_key || flag < 0 {
            return Ok(false);
        }
        let overflow_block = BlockId::new(
            self.contents.block_id().filename.clone(),
            flag as usize,
        );
        let overflow = BTreePage::new(Arc::clone(&self.txn), overflow_block, self.layout.clone())?;
        std::mem::replace(&mut self.contents, overflow).close();
        self.current_slot = None;
        self.next()
    }

    pub fn get_data_rid(&self) -> DbResult<RID> {
        let slot = self
            .current_slot
            .unwrap_or_else(|| panic!("leaf has no current entry"));
        self.contents.get_rid(slot)
    }
}

/// The general format of the BTreePage
/// +--------------------+----------------------+----------------------+
/// | flag (4 bytes)     | record count (4B)    | record slots [...]   |
/// +--------------------+----------------------+----------------------+
///     ^ offset 0            ^ offset 4              ^ offset 8
///
/// The format of the record slot for the leaf page
/// +-------------+---------------+--------------+
/// | dataval     | block number  | slot number  |
/// +-------------+---------------+--------------+
///
/// The format of the record slot for the directory page
/// +-------------+------------------+
/// | dataval     | child block num  |
/// +-------------+------------------+
pub struct BTreePage {
    txn: Arc<Transaction>,
    block_id: BlockId,
    layout: Layout,
}

impl BTreePage {
    pub const NO_OVERFLOW: i32 = -1;
    const HEADER_BYTES: usize = 2 * Page::INT_BYTES;

    /// Pin the block for as long as the page is open
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

    pub fn close(self) {
        self.txn.unpin(&self.block_id);
    }

    /// The rightmost slot holding a value strictly less than the search key
    /// Returns None if the search key belongs at the start of the page
    pub fn find_slot_before(&self, search_key: &Constant) -> DbResult<Option<usize>> {
        let num_recs = self.get_number_of_recs()?;
        let mut slot = 0;
        while slot < num_recs && self.get_data_value(slot)? < *search_key {
            slot += 1;
        }
        Ok(slot.checked_sub(1))
    }

    /// Returns true if adding one more record would exceed the block size
    pub fn is_full(&self) -> DbResult<bool> {
        Ok(self.slot_pos(self.get_number_of_recs()? + 1) > self.txn.block_size())
    }

    /// Move the records from `slot` onwards into a newly appended page with the given flag
    /// This page keeps the records before `slot`
    pub fn split(&self, slot: usize, flag: i32) -> DbResult<BlockId> {
        let block_id = self.txn.append(&self.block_id.filename)?;
        let new_page = BTreePage::new(Arc::clone(&self.txn), block_id.clone(), self.layout.clone())?;
        new_page.format(flag)?;
        let result = self.transfer_records(slot, &new_page);
        new_page.close();
        result.map(|_| block_id)
    }

    fn transfer_records(&self, slot: usize, dest: &BTreePage) -> DbResult<()> {
        let mut dest_slot = 0;
        while slot < self.get_number_of_recs()? {
            dest.insert(dest_slot)?;
            for field in &self.layout.schema.fields {
                dest.set_value(dest_slot, field, &self.get_value(slot, field)?)?;
            }
            self.delete(slot)?;
            dest_slot += 1;
        }
        Ok(())
    }

    /// Write the header and zero every slot
    /// The block is new, so none of these writes are logged
    pub fn format(&self, flag: i32) -> DbResult<()> {
        self.txn.set_int(&self.block_id, 0, flag, false)?;
        self.txn
            .set_int(&self.block_id, Page::INT_BYTES, 0, false)?;
        let mut slot = 0;
        while self.slot_pos(slot + 1) <= self.txn.block_size() {
            for field in &self.layout.schema.fields {
                let pos = self.field_pos(slot, field)?;
                match self.field_type(field)? {
                    FieldType::Int => self.txn.set_int(&self.block_id, pos, 0, false)?,
                    FieldType::String => self.txn.set_string(&self.block_id, pos, "", false)?,
                }
            }
            slot += 1;
        }
        Ok(())
    }

    pub fn get_flag(&self) -> DbResult<i32> {
        self.txn.get_int(&self.block_id, 0)
    }

    pub fn set_flag(&self, value: i32) -> DbResult<()> {
        self.txn.set_int(&self.block_id, 0, value, true)
    }

    pub fn get_data_value(&self, slot: usize) -> DbResult<Constant> {
        self.get_value(slot, IndexInfo::DATA_FIELD)
    }

    pub fn get_child_num(&self, slot: usize) -> DbResult<usize> {
        Ok(self.get_int(slot, IndexInfo::BLOCK_FIELD)? as usize)
    }

    pub fn get_rid(&self, slot: usize) -> DbResult<RID> {
        let block_num = self.get_int(slot, IndexInfo::BLOCK_FIELD)? as usize;
        let slot_num = self.get_int(slot, IndexInfo::ID_FIELD)? as usize;
        Ok(RID::new(block_num, slot_num))
    }

    pub fn insert_dir(&self, slot: usize, value: &Constant, block_num: usize) -> DbResult<()> {
        self.insert(slot)?;
        self.set_value(slot, IndexInfo::DATA_FIELD, value)?;
        self.set_int(slot, IndexInfo::BLOCK_FIELD, block_num as i32)
    }

    pub fn insert_leaf(&self, slot: usize, value: &Constant, rid: RID) -> DbResult<()> {
        self.insert(slot)?;
        self.set_value(slot, IndexInfo::DATA_FIELD, value)?;
        self.set_int(slot, IndexInfo::BLOCK_FIELD, rid.block_num as i32)?;
        self.set_int(slot, IndexInfo::ID_FIELD, rid.slot as i32)
    }

    /// Remove the record at `slot`, shifting the later records left by one
    pub fn delete(&self, slot: usize) -> DbResult<()> {
        let num_recs = self.get_number_of_recs()?;
        for i in slot + 1..num_recs {
            self.copy_record(i, i - 1)?;
        }
        self.set_number_of_recs(num_recs - 1)
    }

    pub fn get_number_of_recs(&self) -> DbResult<usize> {
        Ok(self.txn.get_int(&self.block_id, Page::INT_BYTES)? as usize)
    }

    /// Make room at `slot`, shifting the later records right by one
    fn insert(&self, slot: usize) -> DbResult<()> {
        let num_recs = self.get_number_of_recs()?;
        for i in (slot..num_recs).rev() {
            self.copy_record(i, i + 1)?;
        }
        self.set_number_of_recs(num_recs + 1)
    }

    fn copy_record(&self, from: usize, to: usize) -> DbResult<()> {
        for field in &self.layout.schema.fields {
            self.set_value(to, field, &self.get_value(from, field)?)?;
        }
        Ok(())
    }

    fn set_number_of_recs(&self, num: usize) -> DbResult<()> {
        self.txn
            .set_int(&self.block_id, Page::INT_BYTES, num as i32, true)
    }

    fn field_type(&self, field_name: &str) -> DbResult<FieldType> {
        self.layout.schema.field_type(field_name).ok_or_else(|| {
            DbError::SchemaViolation(format!("field {field_name} not found in index layout"))
        })
    }

    fn get_int(&self, slot: usize, field_name: &str) -> DbResult<i32> {
        self.txn
            .get_int(&self.block_id, self.field_pos(slot, field_name)?)
    }

    fn set_int(&self, slot: usize, field_name: &str, value: i32) -> DbResult<()> {
        self.txn
            .set_int(&self.block_id, self.field_pos(slot, field_name)?, value, true)
    }

    fn get_value(&self, slot: usize, field_name: &str) -> DbResult<Constant> {
        let pos = self.field_pos(slot, field_name)?;
        match self.field_type(field_name)? {
            FieldType::Int => Ok(Constant::Int(self.txn.get_int(&self.block_id, pos)?)),
            FieldType::String => Ok(Constant::String(self.txn.get_string(&self.block_id, pos)?)),
        }
    }

    fn set_value(&self, slot: usize, field_name: &str, value: &Constant) -> DbResult<()> {
        let pos = self.field_pos(slot, field_name)?;
        match (self.field_type(field_name)?, value) {
            (FieldType::Int, Constant::Int(v)) => self.txn.set_int(&self.block_id, pos, *v, true),
            (FieldType::String, Constant::String(v)) => {
                self.layout.schema.check_string(field_name, v)?;
                self.txn.set_string(&self.block_id, pos, v, true)
            }
            (expected, _) => Err(DbError::SchemaViolation(format!(
                "expected {expected:?} for {field_name} but got {value}"
            ))),
        }
    }

    fn field_pos(&self, slot: usize, field_name: &str) -> DbResult<usize> {
        let offset = self.layout.offset(field_name).ok_or_else(|| {
            DbError::SchemaViolation(format!("field {field_name} not found in index layout"))
        })?;
        Ok(self.slot_pos(slot) + offset)
    }

    fn slot_pos(&self, slot: usize) -> usize {
        Self::HEADER_BYTES + slot * self.layout.slot_size()
    }
}

#[cfg(test)]
fn int_leaf_layout() -> Layout {
    IndexInfo::leaf_layout(FieldType::Int, 0)
}



#[cfg(test)]
mod btree_index_tests {
    use std::{
        collections::{HashMap, HashSet},
        sync::Arc,
    };

    use super::*;
    use crate::{test_utils::generate_filename, SimpleDB};

    fn setup_index(tx: &Arc<Transaction>) -> BTreeIndex {
        BTreeIndex::new(Arc::clone(tx), &generate_filename(), int_leaf_layout()).unwrap()
    }

    fn lookup(index: &mut BTreeIndex, key: i32) -> Vec<RID> {
        index.before_first(&Constant::Int(key)).unwrap();
        let mut rids = Vec::new();
        while index.next().unwrap() {
            rids.push(index.get_data_rid().unwrap());
        }
        index.close();
        rids
    }

    #[test]
    fn test_btree_index_construction() {
        let (db, _dir) = SimpleDB::new_for_test(400, 8, 5_000);
        let tx = db.new_tx().unwrap();
        let index = setup_index(&tx);

        let root = BTreeDir::new(
            Arc::clone(&tx),
            index.root_block.clone(),
            index.dir_layout.clone(),
        )
        .unwrap();
        assert_eq!(root.contents.get_number_of_recs().unwrap(), 1);
        assert_eq!(root.contents.get_flag().unwrap(), 0);
        assert_eq!(
            root.contents.get_data_value(0).unwrap(),
            Constant::Int(i32::MIN)
        );
        root.close();
        tx.commit().unwrap();
    }

    #[test]
    fn test_duplicate_keys_are_all_found() {
        let (db, _dir) = SimpleDB::new_for_test(400, 8, 5_000);
        let tx = db.new_tx().unwrap();
        let mut index = setup_index(&tx);
        let values = [10, 20, 10, 20, 30, 20, 30, 10, 10, 20];
        for (i, v) in values.iter().enumerate() {
            index.insert(&Constant::Int(*v), RID::new(1, i)).unwrap();
        }

        let found: HashSet<RID> = lookup(&mut index, 20).into_iter().collect();
        let expected: HashSet<RID> = [1, 3, 5, 9].iter().map(|&s| RID::new(1, s)).collect();
        assert_eq!(found, expected);
        assert_eq!(lookup(&mut index, 10).len(), 4);
        assert!(lookup(&mut index, 15).is_empty());
        tx.commit().unwrap();
    }

    #[test]
    fn test_delete() {
        let (db, _dir) = SimpleDB::new_for_test(400, 8, 5_000);
        let tx = db.new_tx().unwrap();
        let mut index = setup_index(&tx);
        index.insert(&Constant::Int(10), RID::new(1, 1)).unwrap();
        index.insert(&Constant::Int(10), RID::new(1, 2)).unwrap();
        index.delete(&Constant::Int(10), RID::new(1, 1)).unwrap();
        assert_eq!(lookup(&mut index, 10), vec![RID::new(1, 2)]);
        tx.commit().unwrap();
    }

    #[test]
    fn test_deleting_run_head_keeps_overflow_entries_reachable() {
        let (db, _dir) = SimpleDB::new_for_test(400, 8, 5_000);
        let tx = db.new_tx().unwrap();
        let mut index = setup_index(&tx);
        for i in 0..30 {
            index.insert(&Constant::Int(10), RID::new(1, i)).unwrap();
        }
        index.insert(&Constant::Int(20), RID::new(2, 0)).unwrap();

        //  the newest entry always sits in slot 0 of the page in front of the chain
        let mut remaining: HashSet<RID> = (0..30).map(|i| RID::new(1, i)).collect();
        for i in (0..30).rev() {
            index.delete(&Constant::Int(10), RID::new(1, i)).unwrap();
            remaining.remove(&RID::new(1, i));
            let found: HashSet<RID> = lookup(&mut index, 10).into_iter().collect();
            assert_eq!(found, remaining, "after deleting rid (1, {i})");
            assert_eq!(lookup(&mut index, 20), vec![RID::new(2, 0)]);
        }
        tx.commit().unwrap();
    }

    #[test]
    fn test_interleaved_inserts_and_deletes_across_splits() {
        let (db, _dir) = SimpleDB::new_for_test(400, 8, 5_000);
        let tx = db.new_tx().unwrap();
        let mut index = setup_index(&tx);
        let mut expected: HashMap<i32, HashSet<RID>> = HashMap::new();

        //  key 7 builds overflow chains while the rest spread over enough leaves to split the root
        let key_of = |i: usize| if i % 4 == 0 { 7 } else { ((i * 31) % 150) as i32 };
        for i in 0..800 {
            let key = key_of(i);
            let rid = RID::new(i, 1);
            index.insert(&Constant::Int(key), rid).unwrap();
            expected.entry(key).or_default().insert(rid);
            if i % 3 == 2 {
                let victim = i - 2;
                let victim_key = key_of(victim);
                let victim_rid = RID::new(victim, 1);
                index.delete(&Constant::Int(victim_key), victim_rid).unwrap();
                expected.get_mut(&victim_key).unwrap().remove(&victim_rid);
            }
        }

        let root = index.open_root().unwrap();
        assert!(root.contents.get_flag().unwrap() >= 1);
        root.close();

        for key in -1..=150 {
            let found: HashSet<RID> = lookup(&mut index, key).into_iter().collect();
            let want = expected.get(&key).cloned().unwrap_or_default();
            assert_eq!(found, want, "key {key}");
        }
        tx.commit().unwrap();
        assert_eq!(tx.available_buffs(), 8);
    }

    #[test]
    fn test_many_inserts_split_the_root() {
        let (db, _dir) = SimpleDB::new_for_test(400, 8, 5_000);
        let tx = db.new_tx().unwrap();
        let mut index = setup_index(&tx);
        for i in 0..1000 {
            let key = (i * 7919) % 1000;
            index.insert(&Constant::Int(key), RID::new(key as usize, 0)).unwrap();
        }

        let root = index.open_root().unwrap();
        assert!(root.contents.get_flag().unwrap() >= 1);
        root.close();

        for key in [0, 1, 499, 500, 998, 999] {
            assert_eq!(lookup(&mut index, key), vec![RID::new(key as usize, 0)]);
        }
        assert!(lookup(&mut index, 1000).is_empty());
        tx.commit().unwrap();
        assert_eq!(tx.available_buffs(), 8);
    }

    #[test]
    fn test_smaller_key_into_overflowing_leaf() {
        let (db, _dir) = SimpleDB::new_for_test(400, 8, 5_000);
        let tx = db.new_tx().unwrap();
        let mut index = setup_index(&tx);
        for i in 0..60 {
            index.insert(&Constant::Int(20), RID::new(2, i)).unwrap();
        }
        index.insert(&Constant::Int(10), RID::new(1, 0)).unwrap();
        index.insert(&Constant::Int(15), RID::new(1, 5)).unwrap();

        assert_eq!(lookup(&mut index, 20).len(), 60);
        assert_eq!(lookup(&mut index, 10), vec![RID::new(1, 0)]);
        assert_eq!(lookup(&mut index, 15), vec![RID::new(1, 5)]);
        tx.commit().unwrap();
    }

    #[test]
    fn test_string_keys() {
        let (db, _dir) = SimpleDB::new_for_test(400, 8, 5_000);
        let tx = db.new_tx().unwrap();
        let layout = IndexInfo::leaf_layout(FieldType::String, 10);
        let mut index = BTreeIndex::new(Arc::clone(&tx), &generate_filename(), layout).unwrap();
        for i in 0..200 {
            let key = Constant::String(format!("name{:03}", i % 50));
            index.insert(&key, RID::new(i, 0)).unwrap();
        }
        index
            .before_first(&Constant::String("name007".to_string()))
            .unwrap();
        let mut count = 0;
        while index.next().unwrap() {
            count += 1;
        }
        index.close();
        assert_eq!(count, 4);
        tx.commit().unwrap();
    }

    #[test]
    fn test_search_cost() {
        assert_eq!(BTreeIndex::search_cost(1, 10), 1);
        assert_eq!(BTreeIndex::search_cost(10, 10), 2);
        assert_eq!(BTreeIndex::search_cost(11, 10), 3);
        assert_eq!(BTreeIndex::search_cost(1000, 10), 4);
    }
}
