//! Side table construction benchmarks.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};

use lirasm::lir::{Lir, LirList, LiteralPool, PseudoOp};
use lirasm::maps::gc_map::NativePcToReferenceMapBuilder;
use lirasm::maps::mapping_table::{MappingTable, create_mapping_table};

/// A list with `n` safepoints and `n / 4` exported PCs, offsets stamped.
fn stamped_list(n: u32) -> LirList {
    let mut list = LirList::new(false);
    for i in 0..n {
        let call = list.push(Lir::target(1, i * 3, &[])).unwrap();
        list.get_mut(call).offset = i * 8;
        let safepoint = list.mark_safepoint_pc(call).unwrap();
        list.get_mut(safepoint).offset = i * 8 + 4;
        if i % 4 == 0 {
            let exported = list.push(Lir::pseudo(PseudoOp::ExportedPc, i * 3)).unwrap();
            list.get_mut(exported).offset = i * 8 + 4;
        }
    }
    list
}

fn bench_mapping_table(c: &mut Criterion) {
    let mut group = c.benchmark_group("mapping_table");
    for n in [16u32, 256, 4096] {
        let list = stamped_list(n);
        group.bench_with_input(BenchmarkId::new("encode", n), &list, |b, list| {
            b.iter(|| create_mapping_table(black_box(list)).unwrap())
        });
        let table = create_mapping_table(&list).unwrap();
        group.bench_with_input(BenchmarkId::new("decode", n), &table, |b, table| {
            b.iter(|| MappingTable::decode(black_box(table)).unwrap())
        });
    }
    group.finish();
}

fn bench_native_gc_map(c: &mut Criterion) {
    let mut group = c.benchmark_group("native_gc_map");
    for n in [16u32, 256, 4096] {
        let bitmap = vec![0x5a; 4];
        group.bench_with_input(BenchmarkId::new("build", n), &n, |b, &n| {
            b.iter(|| {
                let mut builder = NativePcToReferenceMapBuilder::new(n as usize, n * 8, 4).unwrap();
                for i in 0..n {
                    builder.add_entry(i * 8, &bitmap).unwrap();
                }
                builder.finish()
            })
        });
    }
    group.finish();
}

fn bench_literal_scan(c: &mut Criterion) {
    let mut pool = LiteralPool::new();
    for i in 0..512 {
        pool.add_word(i * 1000);
    }
    c.bench_function("literal_scan_near", |b| {
        b.iter(|| pool.scan_for_near(black_box(250_010), black_box(255)))
    });
}

criterion_group!(benches, bench_mapping_table, bench_native_gc_map, bench_literal_scan);
criterion_main!(benches);
